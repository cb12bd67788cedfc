use anyhow::Result;
use clap::Parser;
use ogconcat::{self, Cli, Command, LogLevel};
use std::{
    fs::{self, File},
    io::BufWriter,
};

// --------------------------------------------------
fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

// --------------------------------------------------
fn run(cli_args: Cli) -> Result<()> {
    let outdir = &cli_args.outdir;
    if !outdir.is_dir() {
        fs::create_dir_all(outdir)?;
    }

    // All logging goes into outdir
    let level = match cli_args.log {
        Some(LogLevel::Debug) => log::LevelFilter::Debug,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .target(env_logger::Target::Pipe(Box::new(BufWriter::new(
            File::create(outdir.join("debug.log"))?,
        ))))
        .init();

    match &cli_args.command {
        Command::Select(args) => ogconcat::select(outdir, args),
        Command::Concat(args) => ogconcat::concat(outdir, args),
    }
}
