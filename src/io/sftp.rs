// ABOUTME: SFTP connections backing @sftp(...) (spec.md §4.5)

use crate::error::RuntimeError;
use ssh2::Session;
use std::io::{Read, Write};
use std::net::TcpStream;

/// Opaque handle returned by `@sftp(...)`. Holds the underlying TCP stream
/// alive alongside the session, since `ssh2::Session` borrows it only as
/// long as the stream is not dropped.
pub struct SftpConnection {
    session: Session,
    host: String,
}

impl SftpConnection {
    pub fn connect(host: &str, port: u16, user: &str, password: Option<&str>) -> Result<Self, RuntimeError> {
        let tcp = TcpStream::connect((host, port))
            .map_err(|e| RuntimeError::network_failure(format!("sftp connect to {host}:{port} failed: {e}")))?;
        let mut session = Session::new()
            .map_err(|e| RuntimeError::network_failure(format!("sftp session init failed: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| RuntimeError::network_failure(format!("sftp handshake failed: {e}")))?;
        match password {
            Some(pw) => session
                .userauth_password(user, pw)
                .map_err(|e| RuntimeError::network_failure(format!("sftp auth failed: {e}")))?,
            None => session
                .userauth_agent(user)
                .map_err(|e| RuntimeError::network_failure(format!("sftp agent auth failed: {e}")))?,
        }
        Ok(SftpConnection { session, host: host.to_string() })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let sftp = self
            .session
            .sftp()
            .map_err(|e| RuntimeError::network_failure(format!("sftp channel failed: {e}")))?;
        let mut file = sftp
            .open(std::path::Path::new(path))
            .map_err(|e| RuntimeError::io_not_found(path).with_hint(e.to_string()))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| RuntimeError::io_failure(format!("sftp read failed: {e}")))?;
        Ok(buf)
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<(), RuntimeError> {
        let sftp = self
            .session
            .sftp()
            .map_err(|e| RuntimeError::network_failure(format!("sftp channel failed: {e}")))?;
        let mut file = sftp
            .create(std::path::Path::new(path))
            .map_err(|e| RuntimeError::io_failure(format!("sftp create failed: {e}")))?;
        file.write_all(data)
            .map_err(|e| RuntimeError::io_failure(format!("sftp write failed: {e}")))?;
        Ok(())
    }
}
