pub fn run() -> anyhow::Result<()> {
    println!("postmortem {}", env!("CARGO_PKG_VERSION"));
    println!("Hypothesis-driven crash dump investigation");
    Ok(())
}
