use std::{error::Error, io, net::SocketAddr, time::Duration};

use clap::Parser;
use pg_stories::{Command, ReplSession, RunnerConfig, cli::PromptError, connect, prompt};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of the server under test
    #[arg(long, default_value = "127.0.0.1:5432")]
    address: SocketAddr,
    /// User to start the session as
    #[arg(long, default_value = "postgres")]
    user: String,
    /// Database to start the session in
    #[arg(long)]
    database: Option<String>,
    /// Budget for each command, in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let timeout = Duration::from_millis(cli.timeout_ms);

    println!("connecting...");
    let conn = connect(cli.address, &cli.user, cli.database.as_deref(), timeout)?;
    println!("connected");

    let config = RunnerConfig {
        timeout,
        ..Default::default()
    };
    let mut session = ReplSession::new(conn, config);

    loop {
        let cmd = match prompt(io::stdin().lock(), io::stdout().lock()) {
            Ok(c) => c,
            Err(e @ PromptError::Unrecognized(_)) => {
                eprintln!("{e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match cmd {
            Command::Exit => break,
            Command::Step(line) if line.is_empty() => {}
            Command::Step(line) => {
                if let Err(e) = session.execute(&line) {
                    eprintln!("{e}");
                }
            }
        }
    }

    Ok(())
}
