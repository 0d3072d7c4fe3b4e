use std::env;
use std::io::{self, Write};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use ticker_core::ServerMessage;
use ticker_protocol::text_codec;

#[tokio::main]
async fn main() -> Result<()> {
    // Where to connect: env override or default.
    let url = env::var("TICKER_CLIENT_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080".to_string());

    println!("Connecting to {}...", url);
    let (mut ws, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("could not connect to {}", url))?;
    println!("Connected. Press ctrl-c to leave.\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = ws.close(None).await;
                println!("\nExiting client.");
                break;
            }
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => match text_codec::decode(&text) {
                    Ok(ServerMessage::Welcome) => println!("{}", text_codec::WELCOME_TEXT),
                    // Replace the previous line in place, like a clock display.
                    Ok(message @ ServerMessage::Time(_)) => {
                        print!("\r{}", text_codec::encode(&message))
                    }
                    Err(err) => eprintln!("\n{}", err),
                },
                Some(Ok(Message::Close(_))) | None => {
                    println!("\nServer closed the connection.");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    eprintln!("\nConnection error: {}", err);
                    break;
                }
            },
        }
        io::stdout().flush()?;
    }

    Ok(())
}
