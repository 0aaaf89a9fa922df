use std::{error::Error, net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use crossbeam_channel::bounded;
use log::warn;
use pg_stories::{RunError, RunnerConfig, Story, StoryBuilder, StoryRunner, connect};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a file of stories
    path: PathBuf,
    /// Address of the server under test
    #[arg(long, default_value = "127.0.0.1:5432")]
    address: SocketAddr,
    /// User to start the session as
    #[arg(long, default_value = "postgres")]
    user: String,
    /// Database to start the session in
    #[arg(long)]
    database: Option<String>,
    /// Budget for each story, in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let stories = StoryBuilder::from_path(&cli.path, vec![])?.collect::<Result<Vec<Story>, _>>()?;

    let (interrupt_tx, interrupt_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })?;

    let timeout = Duration::from_millis(cli.timeout_ms);
    let conn = connect(cli.address, &cli.user, cli.database.as_deref(), timeout)?;
    let config = RunnerConfig {
        timeout,
        ..Default::default()
    };
    let mut runner = StoryRunner::new(conn, config).with_interrupt(interrupt_rx);

    let mut failed = 0;
    for story in &stories {
        match runner.run(story) {
            Ok(()) => println!("ok   {}", story.name),
            Err(RunError::Interrupted) => {
                warn!("interrupted during story '{}'", story.name);
                return Err(RunError::Interrupted.into());
            }
            Err(e) => {
                failed += 1;
                println!("FAIL {}: {e}", story.name);
            }
        }
    }

    if failed > 0 {
        return Err(format!("{failed} of {} stories failed", stories.len()).into());
    }
    Ok(())
}
