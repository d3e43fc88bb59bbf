//! Thread that relays the host's stdin to a session.
//!
//! Reads from stdin block, so they run on a dedicated OS thread and hand
//! each chunk to the async side over a channel.

use std::io::Read;

use tokio::sync::mpsc;

/// Start relaying `reader` on a dedicated OS thread.
///
/// The channel closes when the reader reaches EOF or fails, or when the
/// receiver is dropped.
pub fn start_input_thread<R>(reader: R, input_tx: mpsc::UnboundedSender<String>) -> std::io::Result<()>
where
    R: Read + Send + 'static,
{
    std::thread::Builder::new()
        .name("stdin-relay".to_string())
        .spawn(move || input_loop(reader, &input_tx))?;
    Ok(())
}

fn input_loop<R: Read>(mut reader: R, input_tx: &mpsc::UnboundedSender<String>) {
    let mut buf = [0u8; 4096];
    let mut pending = Vec::new();

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("stdin read failed: {e}");
                return;
            }
        };

        pending.extend_from_slice(&buf[..n]);
        // Hold back a split UTF-8 sequence until the rest arrives.
        let valid = match std::str::from_utf8(&pending) {
            Ok(_) => pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => pending.len(),
        };
        let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
        pending.drain(..valid);

        if !text.is_empty() && input_tx.send(text).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out one scripted chunk per call.
    struct Chunks(Vec<Vec<u8>>);

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.0.is_empty() {
                return Ok(0);
            }
            let chunk = self.0.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[tokio::test]
    async fn test_relays_until_eof() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        start_input_thread(std::io::Cursor::new(b"ls -la\nexit\n".to_vec()), tx).unwrap();

        let mut received = String::new();
        while let Some(text) = rx.recv().await {
            received.push_str(&text);
        }
        assert_eq!(received, "ls -la\nexit\n");
    }

    #[tokio::test]
    async fn test_split_utf8_is_joined() {
        let euro = "€".as_bytes();
        let reader = Chunks(vec![b"price: ".to_vec(), euro[..2].to_vec(), euro[2..].to_vec()]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        start_input_thread(reader, tx).unwrap();

        let mut chunks = Vec::new();
        while let Some(text) = rx.recv().await {
            chunks.push(text);
        }
        assert_eq!(chunks, vec!["price: ".to_string(), "€".to_string()]);
    }
}
