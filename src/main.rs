use anyhow::Result;
use clap::Parser;
use graphlock::logger::summarize_file;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "graphlock - Summarize lock contention from an event log"
)]
struct Cli {
    /// Path to the log file
    log_file: PathBuf,

    /// Print the raw summary structure instead of a table
    #[arg(long)]
    raw: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let summary = summarize_file(&cli.log_file)?;
    if cli.raw {
        println!("{summary:#?}");
    } else {
        print!("{summary}");
    }
    Ok(())
}
