//! Data-received and pin-changed notifications.
//!
//! The I/O loop never calls handlers itself. Events are queued to a
//! dispatcher thread, so a handler may block or call back into the stream
//! (issue a read, say) without stalling the loop.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use derive_more::Display;

use crate::util::lock;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum SerialData {
    /// New bytes arrived, either read by a pending request or waiting in
    /// the driver.
    #[display(fmt = "chars")]
    Chars,
    /// A read returned zero bytes.
    #[display(fmt = "eof")]
    Eof,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum PinChange {
    #[display(fmt = "CTS changed")]
    CtsChanged,
    #[display(fmt = "DSR changed")]
    DsrChanged,
    #[display(fmt = "CD changed")]
    CdChanged,
    #[display(fmt = "ring")]
    Ring,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SerialEvent {
    Data(SerialData),
    Pin(PinChange),
}

type DataHandler = Arc<dyn Fn(SerialData) + Send + Sync>;
type PinHandler = Arc<dyn Fn(PinChange) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: AtomicU64,
    data: Mutex<Vec<(u64, DataHandler)>>,
    pins: Mutex<Vec<(u64, PinHandler)>>,
    data_count: AtomicUsize,
    pin_count: AtomicUsize,
}

#[derive(Clone, Copy, Debug)]
enum Kind {
    Data,
    Pin,
}

/// Keeps a handler registered. Dropping it unsubscribes.
///
/// Unsubscribing the last handler does not stop the I/O loop; the loop
/// stops on its own once it has been idle for a while.
#[must_use = "the handler is unsubscribed when the subscription is dropped"]
pub struct Subscription {
    handlers: Weak<Handlers>,
    kind: Kind,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(handlers) = self.handlers.upgrade() else { return };

        match self.kind {
            Kind::Data => {
                let mut data = lock(&handlers.data);
                data.retain(|(id, _)| *id != self.id);
                handlers.data_count.store(data.len(), Ordering::Release);
            }
            Kind::Pin => {
                let mut pins = lock(&handlers.pins);
                pins.retain(|(id, _)| *id != self.id);
                handlers.pin_count.store(pins.len(), Ordering::Release);
            }
        }
    }
}

pub(crate) struct Notifier {
    tx: async_channel::Sender<SerialEvent>,
    handlers: Arc<Handlers>,
}

impl Notifier {
    /// Spawns the dispatcher thread. It exits once the notifier is closed or
    /// dropped and the remaining events are delivered.
    pub fn start() -> io::Result<Notifier> {
        let (tx, rx) = async_channel::unbounded();
        let handlers = Arc::new(Handlers::default());

        thread::Builder::new()
            .name("serial-events".to_owned())
            .spawn({
                let handlers = handlers.clone();
                move || dispatch(rx, handlers)
            })?;

        Ok(Notifier { tx, handlers })
    }

    pub fn subscribe_data(&self, handler: DataHandler) -> Subscription {
        let id = self.handlers.next_id.fetch_add(1, Ordering::Relaxed);
        let mut data = lock(&self.handlers.data);
        data.push((id, handler));
        self.handlers.data_count.store(data.len(), Ordering::Release);
        self.subscription(Kind::Data, id)
    }

    pub fn subscribe_pins(&self, handler: PinHandler) -> Subscription {
        let id = self.handlers.next_id.fetch_add(1, Ordering::Relaxed);
        let mut pins = lock(&self.handlers.pins);
        pins.push((id, handler));
        self.handlers.pin_count.store(pins.len(), Ordering::Release);
        self.subscription(Kind::Pin, id)
    }

    fn subscription(&self, kind: Kind, id: u64) -> Subscription {
        Subscription {
            handlers: Arc::downgrade(&self.handlers),
            kind,
            id,
        }
    }

    pub fn has_data_handlers(&self) -> bool {
        self.handlers.data_count.load(Ordering::Acquire) > 0
    }

    pub fn has_pin_handlers(&self) -> bool {
        self.handlers.pin_count.load(Ordering::Acquire) > 0
    }

    pub fn has_handlers(&self) -> bool {
        self.has_data_handlers() || self.has_pin_handlers()
    }

    /// Queues `event` for the dispatcher if anyone listens for it.
    pub fn notify(&self, event: SerialEvent) {
        let wanted = match event {
            SerialEvent::Data(_) => self.has_data_handlers(),
            SerialEvent::Pin(_) => self.has_pin_handlers(),
        };

        if wanted {
            // only fails once closed, and then nobody cares
            let _ = self.tx.try_send(event);
        }
    }

    pub fn close(&self) {
        self.tx.close();
    }
}

fn dispatch(rx: async_channel::Receiver<SerialEvent>, handlers: Arc<Handlers>) {
    while let Ok(event) = rx.recv_blocking() {
        match event {
            SerialEvent::Data(data) => {
                // clone out of the lock so handlers can (un)subscribe
                let targets: Vec<DataHandler> = lock(&handlers.data)
                    .iter()
                    .map(|(_, handler)| handler.clone())
                    .collect();

                for handler in targets {
                    invoke(|| handler(data));
                }
            }
            SerialEvent::Pin(change) => {
                let targets: Vec<PinHandler> = lock(&handlers.pins)
                    .iter()
                    .map(|(_, handler)| handler.clone())
                    .collect();

                for handler in targets {
                    invoke(|| handler(change));
                }
            }
        }
    }

    log::debug!("serial event dispatcher finished");
}

fn invoke(handler: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(handler)).is_err() {
        log::error!("serial event handler panicked");
    }
}
