use anyhow::Result;

fn main() -> Result<()> {
    saltpeter::cli::run()
}
