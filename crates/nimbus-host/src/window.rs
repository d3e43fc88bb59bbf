//! Size of the terminal the host itself runs in.

use tokio::sync::mpsc;

/// Current size of the controlling terminal as `(cols, rows)`.
pub fn terminal_size() -> Option<(u16, u16)> {
    match crossterm::terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => Some((cols, rows)),
        Ok(_) => None,
        Err(e) => {
            log::debug!("no controlling terminal size: {e}");
            None
        }
    }
}

/// Send the new terminal size on every window change.
///
/// Must be called from within a tokio runtime. On platforms without
/// `SIGWINCH` the sender is dropped right away.
#[cfg(unix)]
pub fn start_resize_relay(resize_tx: mpsc::UnboundedSender<(u16, u16)>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigwinch = signal(SignalKind::window_change())?;
    tokio::spawn(async move {
        while sigwinch.recv().await.is_some() {
            let Some(size) = terminal_size() else {
                continue;
            };
            if resize_tx.send(size).is_err() {
                return;
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn start_resize_relay(resize_tx: mpsc::UnboundedSender<(u16, u16)>) -> std::io::Result<()> {
    drop(resize_tx);
    Ok(())
}
