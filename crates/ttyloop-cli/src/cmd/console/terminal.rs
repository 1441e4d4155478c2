use std::io;

use console::{Key, Term};
use tokio::sync::mpsc;

/// Ctrl-]
pub const ESCAPE: u8 = 0x1d;

/// Terminal keypresses, encoded as the bytes a serial console expects.
pub struct KeyReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
}

impl KeyReader {
    pub fn new(term: Term) -> Self {
        let (tx, rx) = mpsc::channel(64);
        std::thread::spawn(move || read_key_thread(term, tx));
        KeyReader { rx }
    }

    /// Next encoded key, `None` once the terminal is gone.
    pub async fn next(&mut self) -> Option<io::Result<Vec<u8>>> {
        self.rx.recv().await
    }
}

fn read_key_thread(term: Term, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
    loop {
        let key = match term.read_key() {
            Ok(key) => key,
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
                break;
            }
        };

        let bytes = encode_key(key);
        if bytes.is_empty() {
            continue;
        }

        let Ok(()) = tx.blocking_send(Ok(bytes)) else { return };
    }
}

fn encode_key(key: Key) -> Vec<u8> {
    let mut buff = [0u8; 4];

    let bytes = match key {
        Key::Char(c) => c.encode_utf8(&mut buff).as_bytes(),
        Key::Enter => b"\r",
        Key::Escape => b"\x1b",
        Key::ArrowLeft => b"\x1b[D",
        Key::ArrowRight => b"\x1b[C",
        Key::ArrowUp => b"\x1b[A",
        Key::ArrowDown => b"\x1b[B",
        Key::End => b"\x1b[F",
        Key::Home => b"\x1b[H",
        Key::Tab => b"\t",
        Key::Del => b"\x1b[3~",
        Key::Backspace => &[8],
        k => {
            log::debug!("unknown key: {k:?}");
            return Vec::new();
        }
    };

    Vec::from(bytes)
}
