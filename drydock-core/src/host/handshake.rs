//! Handshake exchange performed immediately after spawning a plugin child.

use anyhow::{anyhow, Context, Result};
use drydock_plugin_sdk::protocol::Handshake;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::time::timeout;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read and validate the single handshake line a plugin writes to stdout
/// before any protocol traffic. A missing or malformed handshake is a
/// fatal launch error (spec §4.A).
pub async fn read_handshake<R>(reader: &mut R, plugin_name: &str) -> Result<Handshake>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let read = timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
        .await
        .with_context(|| format!("plugin `{plugin_name}` did not handshake within {HANDSHAKE_TIMEOUT:?}"))?
        .with_context(|| format!("failed to read handshake line from `{plugin_name}`"))?;

    if read == 0 {
        return Err(anyhow!("plugin `{plugin_name}` closed stdout before handshake"));
    }

    let handshake: Handshake = serde_json::from_str(line.trim())
        .with_context(|| format!("plugin `{plugin_name}` sent a malformed handshake: {line:?}"))?;

    if !handshake.is_valid() {
        return Err(anyhow!(
            "plugin `{plugin_name}` handshake mismatch: got protocol_version={}, magic_cookie={}",
            handshake.protocol_version,
            handshake.magic_cookie_value
        ));
    }

    Ok(handshake)
}
