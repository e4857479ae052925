//! Minimal RESP (REdis Serialization Protocol) codec.
//!
//! Commands go out as arrays of bulk strings; replies come back as one of
//! the five RESP value kinds. Only what the fleet needs is implemented:
//! GET/SETEX/DEL/TTL/PUBLISH/SUBSCRIBE plus AUTH/SELECT at connect time.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Option<String>),
    Array(Option<Vec<Value>>),
}

impl Value {
    pub fn into_bulk(self) -> Option<String> {
        match self {
            Value::Bulk(b) => b,
            Value::Simple(s) => Some(s),
            _ => None,
        }
    }
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for a in args {
        out.extend_from_slice(format!("${}\r\n", a.len()).as_bytes());
        out.extend_from_slice(a.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn bad(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, format!("resp: {msg}"))
}

async fn read_line<R: AsyncBufRead + Unpin + Send>(rd: &mut R) -> std::io::Result<String> {
    let mut line = String::new();
    let n = rd.read_line(&mut line).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof while reading resp line",
        ));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

/// Read one RESP value. Boxed because arrays recurse.
pub fn read_value<'a, R>(
    rd: &'a mut R,
) -> Pin<Box<dyn Future<Output = std::io::Result<Value>> + Send + 'a>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(rd).await?;
        let Some(kind) = line.chars().next() else {
            return Err(bad("empty line"));
        };
        let rest = &line[1..];

        match kind {
            '+' => Ok(Value::Simple(rest.to_string())),
            '-' => Ok(Value::Error(rest.to_string())),
            ':' => Ok(Value::Int(
                rest.parse::<i64>().map_err(|_| bad("bad integer"))?,
            )),
            '$' => {
                let len = rest.parse::<i64>().map_err(|_| bad("bad bulk length"))?;
                if len < 0 {
                    return Ok(Value::Bulk(None));
                }
                let mut buf = vec![0u8; len as usize + 2];
                rd.read_exact(&mut buf).await?;
                if &buf[buf.len() - 2..] != b"\r\n" {
                    return Err(bad("bulk not CRLF terminated"));
                }
                buf.truncate(buf.len() - 2);
                Ok(Value::Bulk(Some(
                    String::from_utf8(buf).map_err(|_| bad("bulk is not utf-8"))?,
                )))
            }
            '*' => {
                let len = rest.parse::<i64>().map_err(|_| bad("bad array length"))?;
                if len < 0 {
                    return Ok(Value::Array(None));
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(read_value(rd).await?);
                }
                Ok(Value::Array(Some(items)))
            }
            _ => Err(bad("unknown value marker")),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};

    #[test]
    fn encodes_commands() {
        let cmd = encode_command(&["SETEX", "k", "60", "v"]);
        assert_eq!(
            cmd,
            b"*4\r\n$5\r\nSETEX\r\n$1\r\nk\r\n$2\r\n60\r\n$1\r\nv\r\n"
        );
    }

    async fn decode(raw: &[u8]) -> Value {
        let (mut a, b) = tokio::io::duplex(1024);
        a.write_all(raw).await.unwrap();
        drop(a);
        let mut rd = BufReader::new(b);
        read_value(&mut rd).await.unwrap()
    }

    #[tokio::test]
    async fn decodes_all_kinds() {
        assert_eq!(decode(b"+OK\r\n").await, Value::Simple("OK".to_string()));
        assert_eq!(
            decode(b"-ERR nope\r\n").await,
            Value::Error("ERR nope".to_string())
        );
        assert_eq!(decode(b":42\r\n").await, Value::Int(42));
        assert_eq!(decode(b":-2\r\n").await, Value::Int(-2));
        assert_eq!(
            decode(b"$5\r\nhello\r\n").await,
            Value::Bulk(Some("hello".to_string()))
        );
        assert_eq!(decode(b"$-1\r\n").await, Value::Bulk(None));
        assert_eq!(
            decode(b"*3\r\n$7\r\nmessage\r\n$4\r\nchan\r\n$2\r\nhi\r\n").await,
            Value::Array(Some(vec![
                Value::Bulk(Some("message".to_string())),
                Value::Bulk(Some("chan".to_string())),
                Value::Bulk(Some("hi".to_string())),
            ]))
        );
    }

    #[tokio::test]
    async fn command_reply_loop_round_trips() {
        let (mut client, server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut rd = BufReader::new(server);
            // Echo the first bulk arg of whatever arrives back as a bulk.
            let v = read_value(&mut rd).await.unwrap();
            let Value::Array(Some(items)) = v else { panic!() };
            let Value::Bulk(Some(cmd)) = &items[0] else { panic!() };
            let reply = format!("${}\r\n{}\r\n", cmd.len(), cmd);
            rd.into_inner().write_all(reply.as_bytes()).await.unwrap();
        });

        client.write_all(&encode_command(&["PING"])).await.unwrap();
        let mut rd = BufReader::new(client);
        assert_eq!(
            read_value(&mut rd).await.unwrap(),
            Value::Bulk(Some("PING".to_string()))
        );
    }
}
