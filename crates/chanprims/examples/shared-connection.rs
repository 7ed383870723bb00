//! Shared-connection example — several worker threads open sessions on one
//! connection, then the connection closes and frees every channel.
//!
//! Run with:
//!   cargo run --example shared-connection --features session

use std::sync::Arc;
use std::thread;

use chanprims::session::{SessionConfig, SessionManager};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Server proposed 8 channels; we asked for no limit.
    let config = SessionConfig {
        channel_max: 0,
        reserved_channels: vec![1],
        name: "example".to_string(),
    };
    let manager = Arc::new(SessionManager::with_negotiated(config, 8)?);

    let workers: Vec<_> = (0..3)
        .map(|worker| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || -> Result<u16, chanprims::session::SessionError> {
                let label = format!("worker-{worker}");
                let channel = manager.open(Some(&label))?;
                eprintln!("[{label}] opened channel {channel}");
                Ok(channel)
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker thread should not panic")?;
    }

    // Leases give back their channel when they go out of scope.
    {
        let lease = manager.allocator().lease_next()?;
        eprintln!("[main] leased channel {}", lease.channel());
    }

    for session in manager.sessions() {
        eprintln!(
            "[main] channel={} label={}",
            session.channel,
            session.label.as_deref().unwrap_or("-")
        );
    }

    let closed = manager.close_all();
    eprintln!(
        "[main] connection closed, {closed} sessions released, still allocated: {:?}",
        manager.allocator().allocated()
    );
    Ok(())
}
