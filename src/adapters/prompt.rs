//! Interactive operator prompt.
//!
//! In interactive mode a Block decision pauses the request and asks the
//! operator on the control terminal. Prompts are serialised: at most one
//! request may be awaiting input at any time.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

/// Single-holder critical section around stdin interaction.
pub struct OperatorPrompt {
    gate: Mutex<()>,
}

impl OperatorPrompt {
    pub fn new() -> Self {
        Self { gate: Mutex::new(()) }
    }

    /// Ask the operator whether to admit a suspicious request. `a` or `A`
    /// admits; anything else (including EOF) denies.
    pub async fn authorize(&self, reason: &str) -> bool {
        let _guard = self.gate.lock().await;

        println!("\n[INTERACTIVE] Suspicious request detected: {reason}");
        print!("[A]pprove or [D]eny? (a/d): ");
        let _ = std::io::stdout().flush();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        match lines.next_line().await {
            Ok(Some(line)) => matches!(line.trim(), "a" | "A"),
            _ => false,
        }
    }
}

impl Default for OperatorPrompt {
    fn default() -> Self {
        Self::new()
    }
}
