//! Byte transport to the server: TCP or Unix domain socket

use crate::Result;
use bytes::BytesMut;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

/// Connected socket
#[derive(Debug)]
pub enum Transport {
    /// TCP socket
    Tcp(TcpStream),
    /// Unix domain socket
    Unix(UnixStream),
}

impl Transport {
    /// Connect over TCP with Nagle disabled
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Transport::Tcp(stream))
    }

    /// Connect to a Unix socket
    pub async fn connect_unix(path: &Path) -> Result<Self> {
        Ok(Transport::Unix(UnixStream::connect(path).await?))
    }

    /// Write and flush `buf`
    pub async fn send(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Tcp(s) => {
                s.write_all(buf).await?;
                s.flush().await?;
            }
            Transport::Unix(s) => {
                s.write_all(buf).await?;
                s.flush().await?;
            }
        }
        Ok(())
    }

    /// Read whatever is available into `buf`; 0 means the peer closed
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = match self {
            Transport::Tcp(s) => s.read_buf(buf).await?,
            Transport::Unix(s) => s.read_buf(buf).await?,
        };
        Ok(n)
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Transport::Tcp(s) => s.shutdown().await?,
            Transport::Unix(s) => s.shutdown().await?,
        }
        Ok(())
    }
}
