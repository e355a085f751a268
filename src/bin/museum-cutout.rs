//! museum-cutout command-line tool

#[cfg(feature = "cli")]
use museum_cutout::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("museum-cutout was built without the `cli` feature");
    std::process::exit(2);
}
