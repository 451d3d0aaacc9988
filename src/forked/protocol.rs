//! Messages between the supervisor and its child, one JSON object per line.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};

use crate::executor::{ExecutionOutcome, ExecutionRequest};
use crate::task::TaskError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    Execute { request: Box<ExecutionRequest> },
    Ping { seq: u64 },
    Kill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// First message on the connection
    Register { id: String },
    /// Answer to `Ping`, carrying the current progress
    Progress { seq: u64, value: i32 },
    Finished {
        outcome: Result<ExecutionOutcome, TaskError>,
    },
}

pub async fn write_message<W, M>(writer: &mut W, message: &M) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Next message, `None` at end of stream. Blank lines are skipped.
pub async fn read_message<R, M>(lines: &mut Lines<R>) -> std::io::Result<Option<M>>
where
    R: AsyncBufRead + Unpin,
    M: DeserializeOwned,
{
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn messages_are_newline_delimited() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut writer) = tokio::io::split(client);
        let (reader, _) = tokio::io::split(server);

        write_message(&mut writer, &ChildMessage::Register { id: "abc".to_string() })
            .await
            .unwrap();
        write_message(
            &mut writer,
            &ChildMessage::Finished {
                outcome: Err(TaskError::user_code("boom")),
            },
        )
        .await
        .unwrap();
        drop(writer);

        let mut lines = BufReader::new(reader).lines();
        match read_message::<_, ChildMessage>(&mut lines).await.unwrap() {
            Some(ChildMessage::Register { id }) => assert_eq!(id, "abc"),
            other => panic!("unexpected message {:?}", other),
        }
        match read_message::<_, ChildMessage>(&mut lines).await.unwrap() {
            Some(ChildMessage::Finished { outcome: Err(e) }) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn parent_messages_are_tagged() {
        let json = serde_json::to_value(ParentMessage::Ping { seq: 7 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ping", "seq": 7}));
        let kill: ParentMessage = serde_json::from_str(r#"{"type":"kill"}"#).unwrap();
        assert!(matches!(kill, ParentMessage::Kill));
    }
}
