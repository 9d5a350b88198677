mod cli;

use clap::Parser;

use cli::args::{Args, Command};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // three ops, one dispatch; each reports a printable summary
    let result = match args.command {
        Command::Setup(op) => op.run(args.config).await.map_err(|e| e.to_string()),
        Command::Add(op) => op.run(args.config).await.map_err(|e| e.to_string()),
        Command::Start(op) => op.run(args.config).await.map_err(|e| e.to_string()),
    };

    match result {
        Ok(output) => println!("{}", output),
        Err(message) => {
            eprintln!("Error: {}", message);
            std::process::exit(1);
        }
    }
}
