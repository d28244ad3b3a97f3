//! Interactive REPL loop: read stdin, dispatch through [`crate::commands::handle_line`],
//! print the reply, repeat until EOF or quit.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::commands;
use crate::context::AppContext;

fn is_quit_command(s: &str) -> bool {
    let lower = s.trim().to_lowercase();
    matches!(lower.as_str(), "quit" | "exit" | "/quit")
}

/// Runs the REPL loop: prompt, read line, dispatch, print, repeat.
///
/// Exits on EOF (Ctrl+D), empty line is a no-op turn (not a quit), and `quit`/`exit`/`/quit`
/// end the session with a closing "Bye." message.
pub async fn run_repl_loop(ctx: &AppContext) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = reader.next_line().await?;

        let line = match line {
            None => break,
            Some(s) if is_quit_command(&s) => break,
            Some(s) => s,
        };

        let reply = commands::handle_line(ctx, &line).await;
        if !reply.is_empty() {
            println!("{reply}");
        }
    }

    println!("Bye.");
    Ok(())
}
