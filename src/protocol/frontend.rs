use super::wire::{
    self, DecodeError, EncodeError, Reader, put_count, put_cstr, put_i16, put_i32, put_u32,
};

/// Protocol version 3.0, sent in the startup message.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Target of a Describe or Close message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Statement,
    Portal,
}

impl ObjectType {
    pub fn tag(self) -> u8 {
        match self {
            ObjectType::Statement => b'S',
            ObjectType::Portal => b'P',
        }
    }
}

impl TryFrom<u8> for ObjectType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'S' => Ok(ObjectType::Statement),
            b'P' => Ok(ObjectType::Portal),
            other => Err(other),
        }
    }
}

/// Messages sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Bind {
        destination_portal: String,
        prepared_statement: String,
        parameters: Vec<Vec<u8>>,
    },
    Close {
        object_type: ObjectType,
        name: String,
    },
    Describe {
        object_type: ObjectType,
        name: String,
    },
    Execute {
        portal: String,
        max_rows: u32,
    },
    Flush,
    Parse {
        name: String,
        query: String,
        parameter_oids: Vec<u32>,
    },
    PasswordMessage {
        password: String,
    },
    Query {
        query: String,
    },
    /// Untagged first message of a connection.
    StartupMessage {
        protocol_version: i32,
        parameters: Vec<(String, String)>,
    },
    Sync,
    Terminate,
}

impl FrontendMessage {
    /// Wire type tag, or `None` for the untagged startup message.
    pub fn tag(&self) -> Option<u8> {
        let tag = match self {
            FrontendMessage::Bind { .. } => b'B',
            FrontendMessage::Close { .. } => b'C',
            FrontendMessage::Describe { .. } => b'D',
            FrontendMessage::Execute { .. } => b'E',
            FrontendMessage::Flush => b'H',
            FrontendMessage::Parse { .. } => b'P',
            FrontendMessage::PasswordMessage { .. } => b'p',
            FrontendMessage::Query { .. } => b'Q',
            FrontendMessage::StartupMessage { .. } => return None,
            FrontendMessage::Sync => b'S',
            FrontendMessage::Terminate => b'X',
        };
        Some(tag)
    }

    /// Encodes the message including its tag and length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut body = Vec::new();
        match self {
            FrontendMessage::Bind {
                destination_portal,
                prepared_statement,
                parameters,
            } => {
                put_cstr(&mut body, destination_portal);
                put_cstr(&mut body, prepared_statement);
                // Parameter format codes: none, all text.
                put_i16(&mut body, 0);
                put_count(&mut body, b'B', parameters.len())?;
                for param in parameters {
                    wire::put_nullable(&mut body, Some(param.as_slice()))?;
                }
                // Result format codes: none.
                put_i16(&mut body, 0);
            }
            FrontendMessage::Close { object_type, name }
            | FrontendMessage::Describe { object_type, name } => {
                body.push(object_type.tag());
                put_cstr(&mut body, name);
            }
            FrontendMessage::Execute { portal, max_rows } => {
                put_cstr(&mut body, portal);
                put_u32(&mut body, *max_rows);
            }
            FrontendMessage::Parse {
                name,
                query,
                parameter_oids,
            } => {
                put_cstr(&mut body, name);
                put_cstr(&mut body, query);
                put_count(&mut body, b'P', parameter_oids.len())?;
                for oid in parameter_oids {
                    put_u32(&mut body, *oid);
                }
            }
            FrontendMessage::PasswordMessage { password } => put_cstr(&mut body, password),
            FrontendMessage::Query { query } => put_cstr(&mut body, query),
            FrontendMessage::StartupMessage {
                protocol_version,
                parameters,
            } => {
                put_i32(&mut body, *protocol_version);
                for (key, value) in parameters {
                    put_cstr(&mut body, key);
                    put_cstr(&mut body, value);
                }
                body.push(0);

                let mut out = Vec::with_capacity(body.len() + wire::LENGTH_SIZE);
                wire::put_len(&mut out, body.len() + wire::LENGTH_SIZE)?;
                out.extend_from_slice(&body);
                return Ok(out);
            }
            FrontendMessage::Flush | FrontendMessage::Sync | FrontendMessage::Terminate => {}
        }

        // Every variant except the startup message carries a tag.
        let tag = self.tag().unwrap_or_default();
        wire::frame(tag, &body)
    }

    /// Decodes a tagged message body (everything after the length prefix).
    pub fn decode(tag: u8, body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(tag, body);
        let msg = match tag {
            b'B' => {
                let destination_portal = r.cstr()?;
                let prepared_statement = r.cstr()?;
                let formats = r.count()?;
                for _ in 0..formats {
                    r.i16()?;
                }
                let count = r.count()?;
                let mut parameters = Vec::with_capacity(count);
                for _ in 0..count {
                    parameters.push(r.nullable()?.unwrap_or_default());
                }
                let results = r.count()?;
                for _ in 0..results {
                    r.i16()?;
                }
                FrontendMessage::Bind {
                    destination_portal,
                    prepared_statement,
                    parameters,
                }
            }
            b'C' | b'D' => {
                let raw = r.u8()?;
                let object_type =
                    ObjectType::try_from(raw).map_err(|b| DecodeError::InvalidField {
                        tag: char::from(tag),
                        reason: format!("unknown object type '{}'", char::from(b)),
                    })?;
                let name = r.cstr()?;
                if tag == b'C' {
                    FrontendMessage::Close { object_type, name }
                } else {
                    FrontendMessage::Describe { object_type, name }
                }
            }
            b'E' => FrontendMessage::Execute {
                portal: r.cstr()?,
                max_rows: r.u32()?,
            },
            b'H' => FrontendMessage::Flush,
            b'P' => {
                let name = r.cstr()?;
                let query = r.cstr()?;
                let count = r.count()?;
                let mut parameter_oids = Vec::with_capacity(count);
                for _ in 0..count {
                    parameter_oids.push(r.u32()?);
                }
                FrontendMessage::Parse {
                    name,
                    query,
                    parameter_oids,
                }
            }
            b'p' => FrontendMessage::PasswordMessage { password: r.cstr()? },
            b'Q' => FrontendMessage::Query { query: r.cstr()? },
            b'S' => FrontendMessage::Sync,
            b'X' => FrontendMessage::Terminate,
            other => return Err(DecodeError::UnknownTag(char::from(other))),
        };
        r.finish()?;
        Ok(msg)
    }

    /// Decodes the body of a startup message (everything after the length).
    pub fn decode_startup(body: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(0, body);
        let protocol_version = r.i32()?;
        let mut parameters = Vec::new();
        loop {
            let key = r.cstr()?;
            if key.is_empty() {
                break;
            }
            parameters.push((key, r.cstr()?));
        }
        r.finish()?;
        Ok(FrontendMessage::StartupMessage {
            protocol_version,
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(encoded: &[u8]) -> (u8, &[u8]) {
        (encoded[0], &encoded[1 + wire::LENGTH_SIZE..])
    }

    #[test]
    fn encode_query() {
        let msg = FrontendMessage::Query {
            query: "SELECT 1".into(),
        };
        let mut expected = vec![b'Q', 0, 0, 0, 13];
        expected.extend_from_slice(b"SELECT 1\0");
        assert_eq!(msg.encode().unwrap(), expected);
    }

    #[test]
    fn encode_sync_has_empty_body() {
        assert_eq!(
            FrontendMessage::Sync.encode().unwrap(),
            vec![b'S', 0, 0, 0, 4]
        );
    }

    #[test]
    fn bind_with_too_many_parameters_fails() {
        let msg = FrontendMessage::Bind {
            destination_portal: "".into(),
            prepared_statement: "".into(),
            parameters: vec![b"1".to_vec(); 40_000],
        };
        assert_eq!(
            msg.encode(),
            Err(EncodeError::TooManyEntries {
                tag: 'B',
                count: 40_000
            })
        );
    }

    #[test]
    fn parse_with_too_many_oids_fails() {
        let msg = FrontendMessage::Parse {
            name: "".into(),
            query: "SELECT 1".into(),
            parameter_oids: vec![23; 32_768],
        };
        assert!(matches!(
            msg.encode(),
            Err(EncodeError::TooManyEntries { tag: 'P', .. })
        ));
    }

    #[test]
    fn bind_survives_decode() {
        let msg = FrontendMessage::Bind {
            destination_portal: "portal".into(),
            prepared_statement: "stmt".into(),
            parameters: vec![b"baa".to_vec(), 1.5f64.to_le_bytes().to_vec()],
        };
        let encoded = msg.encode().unwrap();
        let (tag, body) = split(&encoded);
        assert_eq!(FrontendMessage::decode(tag, body).unwrap(), msg);
    }

    #[test]
    fn parse_survives_decode() {
        let msg = FrontendMessage::Parse {
            name: "".into(),
            query: "SELECT $1".into(),
            parameter_oids: vec![23, 25],
        };
        let encoded = msg.encode().unwrap();
        let (tag, body) = split(&encoded);
        assert_eq!(FrontendMessage::decode(tag, body).unwrap(), msg);
    }

    #[test]
    fn startup_message_is_untagged() {
        let msg = FrontendMessage::StartupMessage {
            protocol_version: PROTOCOL_VERSION,
            parameters: vec![("user".into(), "postgres".into())],
        };
        let encoded = msg.encode().unwrap();
        let len = i32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len());
        assert_eq!(msg.tag(), None);
        assert_eq!(
            FrontendMessage::decode_startup(&encoded[wire::LENGTH_SIZE..]).unwrap(),
            msg
        );
    }

    #[test]
    fn decode_rejects_bad_object_type() {
        let mut body = vec![b'X'];
        body.extend_from_slice(b"name\0");
        assert!(matches!(
            FrontendMessage::decode(b'D', &body),
            Err(DecodeError::InvalidField { tag: 'D', .. })
        ));
    }

    #[test]
    fn decode_unknown_tag() {
        assert_eq!(
            FrontendMessage::decode(b'?', &[]),
            Err(DecodeError::UnknownTag('?'))
        );
    }
}
