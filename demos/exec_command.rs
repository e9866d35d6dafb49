//! Streams the output of one command run in a server terminal.
//!
//! Usage: `exec_command <server> <terminal> <command...>`, with the
//! connection configured through `KOMODO_ADDRESS` and credentials.

use std::error::Error;

use komodo_realtime_sdk::terminal::exec::{ExecExit, ExecuteTerminalBody};
use komodo_realtime_sdk::KomodoClient;

fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let (Some(server), Some(terminal)) = (args.next(), args.next()) else {
        return Err("usage: exec_command <server> <terminal> <command...>".into());
    };
    let command = args.collect::<Vec<_>>().join(" ");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = KomodoClient::from_env()?;
        let body = ExecuteTerminalBody {
            server,
            terminal,
            command,
            init: None,
        };

        let mut exit = ExecExit::EarlyExit;
        client
            .execute_terminal(&body, |line| println!("{line}"), |code| exit = code)
            .await?;

        eprintln!("exit code: {exit}");
        Ok::<(), Box<dyn Error>>(())
    })
}
