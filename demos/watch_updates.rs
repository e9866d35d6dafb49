//! Update feed example.
//!
//! Connects to the Komodo update websocket and prints every task update
//! for 60 seconds.
//!
//! Before running, export `KOMODO_ADDRESS` plus either `KOMODO_API_KEY` and
//! `KOMODO_API_SECRET` or `KOMODO_JWT`.

use std::error::Error;
use std::time::Duration;

use komodo_realtime_sdk::stream::client::{ConnectionEvent, UpdateEvent};
use komodo_realtime_sdk::stream::supervisor::{CancelToken, SubscribeOptions};
use komodo_realtime_sdk::KomodoClient;
use tokio::sync::mpsc;

fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = KomodoClient::from_env()?;
        let cancel = CancelToken::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<UpdateEvent>();

        let options = SubscribeOptions::with_cancel(cancel.clone())
            .on_cancel(|| println!("update feed cancelled"));

        let printer = async {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ConnectionEvent::Opened => println!("connected, logging in"),
                    ConnectionEvent::LoggedIn => println!("logged in"),
                    ConnectionEvent::Message(update) => {
                        println!(
                            "update id={} status={:?}",
                            update.id().unwrap_or("-"),
                            update.status
                        );
                    }
                    ConnectionEvent::Closed => println!("connection closed"),
                }
            }
        };

        let deadline = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            cancel.cancel();
        };

        tokio::join!(
            client.subscribe_to_update_websocket(events_tx, options),
            printer,
            deadline
        );
        Ok::<(), Box<dyn Error>>(())
    })
}
