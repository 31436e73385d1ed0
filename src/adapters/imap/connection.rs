use async_imap::error::Error as ImapError;
use async_imap::types::Mailbox;
use async_imap::Session;
use async_native_tls::TlsStream;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

use crate::config::ImapConfig;
use crate::types::MailError;

// TLS over tokio TCP, bridged to futures-io for async-imap.
pub type ImapSession = Session<TlsStream<Compat<TcpStream>>>;

/// Dropped connections and I/O failures are worth retrying; server refusals
/// (NO/BAD, parse errors) are not.
pub fn imap_error(context: &str, err: ImapError) -> MailError {
    match err {
        ImapError::Io(_) | ImapError::ConnectionLost => {
            MailError::transient(format!("{}: {}", context, err))
        }
        other => MailError::permanent(format!("{}: {}", context, other)),
    }
}

pub async fn connect(config: &ImapConfig) -> Result<ImapSession, MailError> {
    info!(host = %config.host, port = config.port, "Connecting to IMAP server");

    let tcp = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|e| MailError::transient(format!("TCP connection failed: {}", e)))?;

    let tls = async_native_tls::TlsConnector::new();
    let tls_stream = tls
        .connect(config.host.as_str(), tcp.compat())
        .await
        .map_err(|e| MailError::transient(format!("TLS handshake failed: {}", e)))?;

    let client = async_imap::Client::new(tls_stream);

    let session = client
        .login(&config.username, &config.password)
        .await
        .map_err(|(e, _)| MailError::permanent(format!("Login failed: {}", e)))?;

    debug!("Logged in as {}", config.username);
    Ok(session)
}

pub async fn select(session: &mut ImapSession, mailbox: &str) -> Result<Mailbox, MailError> {
    let mailbox = session
        .select(mailbox)
        .await
        .map_err(|e| imap_error("SELECT failed", e))?;
    Ok(mailbox)
}
