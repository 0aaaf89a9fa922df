pub mod cli;
pub mod protocol;
pub mod session;
pub mod story;

#[cfg(test)]
mod testing;

pub use cli::{Command, prompt};
pub use session::{ReplSession, SessionError, connect};
pub use story::{RunError, RunnerConfig, Step, Story, StoryBuilder, StoryRunner};
