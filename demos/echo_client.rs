//! A simple echo client driven from a tick loop.
//!
//! Connects to a public WebSocket echo server, sends a message once the
//! handshake completes, prints the echoes and closes.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use websockets_tick::{Config, Engine, Event, State, callback};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("websockets_tick=debug"))
        .with_target(false)
        .init();

    let mut engine = Engine::new(Config::default().with_debug_level(1));

    let echoes = Rc::new(RefCell::new(Vec::<String>::new()));
    let sink = echoes.clone();
    println!("Connecting to WebSocket echo server...");
    let handle = engine.open(
        "wss://echo.websocket.org/",
        callback(move |handle, event| match event {
            Event::Connected => println!("{handle} connected"),
            Event::Message(bytes) => sink
                .borrow_mut()
                .push(String::from_utf8_lossy(bytes).into_owned()),
            Event::Error(err) => eprintln!("{handle} failed: {err}"),
            Event::Disconnected => println!("{handle} disconnected"),
        }),
    )?;

    let message = "Hello from websockets-tick!";
    let mut sent = false;
    while !engine.is_empty() {
        engine.tick();

        if !sent && engine.state(handle) == Some(State::Connected) {
            engine.send_text(handle, message)?;
            println!("Message sent: {message}");
            sent = true;
        }
        // The server greets first, then echoes.
        if echoes.borrow().iter().any(|m| m == message) {
            engine.close(handle);
        }
        thread::sleep(Duration::from_millis(10));
    }

    for echo in echoes.borrow().iter() {
        println!("Echo received: {echo}");
    }
    Ok(())
}
