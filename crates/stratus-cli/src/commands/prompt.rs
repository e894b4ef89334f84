use std::io::{self, BufRead, Write};

use stratus_lifecycle::Prompt;

/// Asks on stdout and reads the answer from stdin. Only `y` confirms.
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn confirm(&self, message: &str) -> bool {
        let mut stdout = io::stdout();
        if write!(stdout, "{message}").and_then(|()| stdout.flush()).is_err() {
            return false;
        }
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => is_affirmative(&answer),
            Err(_) => false,
        }
    }
}

fn is_affirmative(answer: &str) -> bool {
    answer.trim() == "y"
}
