use anyhow::Result;

#[cfg(target_os = "linux")]
fn main() -> Result<()> {
    opcodebox::cli::run()
}

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    anyhow::bail!("opcodebox needs Linux sandboxing primitives")
}
