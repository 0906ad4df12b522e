use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to create the channel")]
    Create(#[source] nix::Error),
    #[error("failed to send a message")]
    Send(#[source] std::io::Error),
    #[error("failed to receive a message")]
    Receive(#[source] std::io::Error),
    #[error("failed to encode a message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode a message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("the peer closed the channel")]
    Closed,
    #[error("failed to change channel fd flags")]
    Fcntl(#[source] nix::Error),
}

type Result<T> = std::result::Result<T, ChannelError>;

/// Creates a unidirectional message channel over a pipe. The fds survive
/// exec so the two halves can live on opposite sides of the trampoline
/// re-exec; messages are single lines of JSON.
pub fn channel<T>() -> Result<(Sender<T>, Receiver<T>)> {
    let (read, write) = nix::unistd::pipe().map_err(ChannelError::Create)?;
    Ok((
        Sender { file: File::from(write), _marker: PhantomData },
        Receiver { reader: BufReader::new(File::from(read)), _marker: PhantomData },
    ))
}

pub struct Sender<T> {
    file: File,
    _marker: PhantomData<T>,
}

impl<T: Serialize> Sender<T> {
    pub fn send(&mut self, message: &T) -> Result<()> {
        let mut line = serde_json::to_vec(message).map_err(ChannelError::Encode)?;
        line.push(b'\n');
        self.file.write_all(&line).map_err(ChannelError::Send)?;
        self.file.flush().map_err(ChannelError::Send)
    }

    /// Arranges for the fd to vanish on a successful exec, which the peer
    /// observes as end-of-channel.
    pub fn set_cloexec(&self) -> Result<()> {
        fcntl(self.file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map(|_| ())
            .map_err(ChannelError::Fcntl)
    }

    /// The fd number as it will be seen across fork and exec.
    pub fn as_fd_number(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Reattaches a sender inherited across an exec boundary.
    ///
    /// # Safety-adjacent contract
    /// The fd must be the write end of a pipe created by `channel` in the
    /// parent process.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self { file: unsafe { File::from_raw_fd(fd) }, _marker: PhantomData }
    }
}

pub struct Receiver<T> {
    reader: BufReader<File>,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> Receiver<T> {
    pub fn recv(&mut self) -> Result<T> {
        match self.recv_or_eof()? {
            Some(message) => Ok(message),
            None => Err(ChannelError::Closed),
        }
    }

    /// Like `recv`, but reports a closed channel as `None`. Used to detect
    /// the successful exec of the container process.
    pub fn recv_or_eof(&mut self) -> Result<Option<T>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).map_err(ChannelError::Receive)?;
        if read == 0 {
            return Ok(None);
        }

        serde_json::from_str(&line).map(Some).map_err(ChannelError::Decode)
    }

    /// The fd number as it will be seen across fork and exec.
    pub fn as_fd_number(&self) -> RawFd {
        self.reader.get_ref().as_raw_fd()
    }

    /// Reattaches a receiver inherited across an exec boundary, see
    /// `Sender::from_raw_fd`.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self { reader: BufReader::new(unsafe { File::from_raw_fd(fd) }), _marker: PhantomData }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum TestMessage {
        Ping,
        Value(u32),
    }

    #[test]
    fn test_send_and_receive() {
        let (mut tx, mut rx) = channel::<TestMessage>().unwrap();

        tx.send(&TestMessage::Ping).unwrap();
        tx.send(&TestMessage::Value(42)).unwrap();

        assert_eq!(rx.recv().unwrap(), TestMessage::Ping);
        assert_eq!(rx.recv().unwrap(), TestMessage::Value(42));
    }

    #[test]
    fn test_eof_after_sender_drop() {
        let (tx, mut rx) = channel::<TestMessage>().unwrap();
        drop(tx);

        assert!(rx.recv_or_eof().unwrap().is_none());
        assert!(matches!(rx.recv(), Err(ChannelError::Closed)));
    }
}
