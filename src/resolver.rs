//! Background address resolution.
//!
//! Name resolution blocks, so it runs on one dedicated worker thread.
//! Requests are queued over a channel; completions are posted back into
//! the reactor and never touch connection state from the worker.

use crate::session::Post;
use crossbeam::channel::{self, Sender};
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

struct ResolveRequest {
    host: String,
    port: u16,
}

/// Handle to the resolve worker. Dropping it shuts the worker down.
pub struct Resolver {
    tx: Option<Sender<ResolveRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl Resolver {
    /// Starts the worker thread, posting results through `post`.
    pub fn spawn(post: UnboundedSender<Post>) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded::<ResolveRequest>();
        let worker = std::thread::Builder::new()
            .name("resolver".into())
            .spawn(move || {
                while let Ok(req) = rx.recv() {
                    let addrs: Vec<SocketAddr> = match (req.host.as_str(), req.port)
                        .to_socket_addrs()
                    {
                        Ok(iter) => iter.collect(),
                        Err(e) => {
                            debug!(host = %req.host, "resolve failed: {e}");
                            Vec::new()
                        }
                    };
                    if post
                        .send(Post::Resolved {
                            host: req.host,
                            port: req.port,
                            addrs,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Queues an async resolve of `host:port`.
    pub fn resolve(&self, host: String, port: u16) {
        if let Some(tx) = &self.tx {
            if tx.send(ResolveRequest { host, port }).is_err() {
                warn!("resolver worker is gone");
            }
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        // closing the channel lets the worker exit its recv loop
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
