//! Yes/no confirmation prompts.
//!
//! The engine only sees the [`Prompt`] trait. Non-interactive runs never
//! prompt; flags supply the answer up front instead.

use crate::Result;
use std::io::{self, BufRead, Write};

/// Something that can ask the operator a yes/no question.
pub trait Prompt {
    fn confirm(&mut self, message: &str) -> Result<bool>;
}

/// How the engine obtains confirmations.
pub enum Interaction {
    Interactive(Box<dyn Prompt>),
    NonInteractive,
}

impl Interaction {
    pub fn is_interactive(&self) -> bool {
        matches!(self, Interaction::Interactive(_))
    }
}

/// Prompt on stderr, read the answer from stdin. Anything but y/yes is "no".
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn confirm(&mut self, message: &str) -> Result<bool> {
        let mut stderr = io::stderr();
        write!(stderr, "{} [y/N] ", message)?;
        stderr.flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

/// Prompt that replays canned answers, for tests.
#[cfg(test)]
pub(crate) struct ScriptedPrompt {
    pub answers: std::collections::VecDeque<bool>,
    pub asked: std::rc::Rc<std::cell::RefCell<Vec<String>>>,
}

#[cfg(test)]
impl ScriptedPrompt {
    pub fn new(answers: &[bool]) -> Self {
        Self {
            answers: answers.iter().copied().collect(),
            asked: Default::default(),
        }
    }
}

#[cfg(test)]
impl Prompt for ScriptedPrompt {
    fn confirm(&mut self, message: &str) -> Result<bool> {
        self.asked.borrow_mut().push(message.to_string());
        Ok(self.answers.pop_front().unwrap_or(false))
    }
}
