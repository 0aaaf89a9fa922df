use std::fmt;

use super::wire::{
    self, DecodeError, EncodeError, Reader, put_count, put_cstr, put_i16, put_i32, put_nullable,
    put_u32,
};

/// SQLSTATE field identifier inside an ErrorResponse or NoticeResponse.
pub const FIELD_CODE: u8 = b'C';
pub const FIELD_SEVERITY: u8 = b'S';
pub const FIELD_MESSAGE: u8 = b'M';

/// Protocol-level kind of a backend message.
///
/// Every kind maps to exactly one wire type tag, so comparing kinds is the
/// same as comparing the leading byte of two encoded messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ParseComplete,
    BindComplete,
    CloseComplete,
    NotificationResponse,
    CopyDone,
    CopyFail,
    CommandComplete,
    CopyData,
    DataRow,
    ErrorResponse,
    CopyInResponse,
    CopyOutResponse,
    EmptyQueryResponse,
    BackendKeyData,
    NoData,
    NoticeResponse,
    Authentication,
    ParameterStatus,
    ParameterDescription,
    RowDescription,
    FunctionCallResponse,
    CopyBothResponse,
    ReadyForQuery,
    PortalSuspended,
}

impl MessageKind {
    pub const ALL: [MessageKind; 24] = [
        MessageKind::ParseComplete,
        MessageKind::BindComplete,
        MessageKind::CloseComplete,
        MessageKind::NotificationResponse,
        MessageKind::CopyDone,
        MessageKind::CopyFail,
        MessageKind::CommandComplete,
        MessageKind::CopyData,
        MessageKind::DataRow,
        MessageKind::ErrorResponse,
        MessageKind::CopyInResponse,
        MessageKind::CopyOutResponse,
        MessageKind::EmptyQueryResponse,
        MessageKind::BackendKeyData,
        MessageKind::NoData,
        MessageKind::NoticeResponse,
        MessageKind::Authentication,
        MessageKind::ParameterStatus,
        MessageKind::ParameterDescription,
        MessageKind::RowDescription,
        MessageKind::FunctionCallResponse,
        MessageKind::CopyBothResponse,
        MessageKind::ReadyForQuery,
        MessageKind::PortalSuspended,
    ];

    /// Single-byte wire type tag.
    pub fn tag(self) -> u8 {
        match self {
            MessageKind::ParseComplete => b'1',
            MessageKind::BindComplete => b'2',
            MessageKind::CloseComplete => b'3',
            MessageKind::NotificationResponse => b'A',
            MessageKind::CopyDone => b'c',
            MessageKind::CopyFail => b'f',
            MessageKind::CommandComplete => b'C',
            MessageKind::CopyData => b'd',
            MessageKind::DataRow => b'D',
            MessageKind::ErrorResponse => b'E',
            MessageKind::CopyInResponse => b'G',
            MessageKind::CopyOutResponse => b'H',
            MessageKind::EmptyQueryResponse => b'I',
            MessageKind::BackendKeyData => b'K',
            MessageKind::NoData => b'n',
            MessageKind::NoticeResponse => b'N',
            MessageKind::Authentication => b'R',
            MessageKind::ParameterStatus => b'S',
            MessageKind::ParameterDescription => b't',
            MessageKind::RowDescription => b'T',
            MessageKind::FunctionCallResponse => b'V',
            MessageKind::CopyBothResponse => b'W',
            MessageKind::ReadyForQuery => b'Z',
            MessageKind::PortalSuspended => b's',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ('{}')", self, char::from(self.tag()))
    }
}

/// Identified fields of an ErrorResponse or NoticeResponse, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields(pub Vec<(u8, String)>);

impl ErrorFields {
    /// Fields carrying only a SQLSTATE code.
    pub fn with_code(code: impl Into<String>) -> Self {
        Self(vec![(FIELD_CODE, code.into())])
    }

    pub fn get(&self, field: u8) -> Option<&str> {
        self.0
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v.as_str())
    }

    /// SQLSTATE code, empty when absent.
    pub fn code(&self) -> &str {
        self.get(FIELD_CODE).unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.get(FIELD_MESSAGE).unwrap_or_default()
    }
}

/// One column of a RowDescription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Messages sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    ParseComplete,
    BindComplete,
    CloseComplete,
    NotificationResponse {
        process_id: u32,
        channel: String,
        payload: String,
    },
    CopyDone,
    CopyFail {
        message: String,
    },
    CommandComplete {
        tag: String,
    },
    CopyData {
        data: Vec<u8>,
    },
    DataRow {
        values: Vec<Option<Vec<u8>>>,
    },
    ErrorResponse(ErrorFields),
    CopyInResponse {
        format: u8,
        column_formats: Vec<i16>,
    },
    CopyOutResponse {
        format: u8,
        column_formats: Vec<i16>,
    },
    EmptyQueryResponse,
    BackendKeyData {
        process_id: u32,
        secret_key: u32,
    },
    NoData,
    NoticeResponse(ErrorFields),
    /// Authentication request; `code` 0 is AuthenticationOk.
    Authentication {
        code: u32,
        data: Vec<u8>,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    ParameterDescription {
        oids: Vec<u32>,
    },
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    FunctionCallResponse {
        result: Option<Vec<u8>>,
    },
    CopyBothResponse {
        format: u8,
        column_formats: Vec<i16>,
    },
    ReadyForQuery {
        status: u8,
    },
    PortalSuspended,
}

impl BackendMessage {
    /// Bare message of the given kind with every field empty.
    pub fn empty(kind: MessageKind) -> Self {
        match kind {
            MessageKind::ParseComplete => BackendMessage::ParseComplete,
            MessageKind::BindComplete => BackendMessage::BindComplete,
            MessageKind::CloseComplete => BackendMessage::CloseComplete,
            MessageKind::NotificationResponse => BackendMessage::NotificationResponse {
                process_id: 0,
                channel: String::new(),
                payload: String::new(),
            },
            MessageKind::CopyDone => BackendMessage::CopyDone,
            MessageKind::CopyFail => BackendMessage::CopyFail {
                message: String::new(),
            },
            MessageKind::CommandComplete => BackendMessage::CommandComplete { tag: String::new() },
            MessageKind::CopyData => BackendMessage::CopyData { data: Vec::new() },
            MessageKind::DataRow => BackendMessage::DataRow { values: Vec::new() },
            MessageKind::ErrorResponse => BackendMessage::ErrorResponse(ErrorFields::default()),
            MessageKind::CopyInResponse => BackendMessage::CopyInResponse {
                format: 0,
                column_formats: Vec::new(),
            },
            MessageKind::CopyOutResponse => BackendMessage::CopyOutResponse {
                format: 0,
                column_formats: Vec::new(),
            },
            MessageKind::EmptyQueryResponse => BackendMessage::EmptyQueryResponse,
            MessageKind::BackendKeyData => BackendMessage::BackendKeyData {
                process_id: 0,
                secret_key: 0,
            },
            MessageKind::NoData => BackendMessage::NoData,
            MessageKind::NoticeResponse => BackendMessage::NoticeResponse(ErrorFields::default()),
            MessageKind::Authentication => BackendMessage::Authentication {
                code: 0,
                data: Vec::new(),
            },
            MessageKind::ParameterStatus => BackendMessage::ParameterStatus {
                name: String::new(),
                value: String::new(),
            },
            MessageKind::ParameterDescription => {
                BackendMessage::ParameterDescription { oids: Vec::new() }
            }
            MessageKind::RowDescription => BackendMessage::RowDescription { fields: Vec::new() },
            MessageKind::FunctionCallResponse => {
                BackendMessage::FunctionCallResponse { result: None }
            }
            MessageKind::CopyBothResponse => BackendMessage::CopyBothResponse {
                format: 0,
                column_formats: Vec::new(),
            },
            MessageKind::ReadyForQuery => BackendMessage::ReadyForQuery { status: b'I' },
            MessageKind::PortalSuspended => BackendMessage::PortalSuspended,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            BackendMessage::ParseComplete => MessageKind::ParseComplete,
            BackendMessage::BindComplete => MessageKind::BindComplete,
            BackendMessage::CloseComplete => MessageKind::CloseComplete,
            BackendMessage::NotificationResponse { .. } => MessageKind::NotificationResponse,
            BackendMessage::CopyDone => MessageKind::CopyDone,
            BackendMessage::CopyFail { .. } => MessageKind::CopyFail,
            BackendMessage::CommandComplete { .. } => MessageKind::CommandComplete,
            BackendMessage::CopyData { .. } => MessageKind::CopyData,
            BackendMessage::DataRow { .. } => MessageKind::DataRow,
            BackendMessage::ErrorResponse(_) => MessageKind::ErrorResponse,
            BackendMessage::CopyInResponse { .. } => MessageKind::CopyInResponse,
            BackendMessage::CopyOutResponse { .. } => MessageKind::CopyOutResponse,
            BackendMessage::EmptyQueryResponse => MessageKind::EmptyQueryResponse,
            BackendMessage::BackendKeyData { .. } => MessageKind::BackendKeyData,
            BackendMessage::NoData => MessageKind::NoData,
            BackendMessage::NoticeResponse(_) => MessageKind::NoticeResponse,
            BackendMessage::Authentication { .. } => MessageKind::Authentication,
            BackendMessage::ParameterStatus { .. } => MessageKind::ParameterStatus,
            BackendMessage::ParameterDescription { .. } => MessageKind::ParameterDescription,
            BackendMessage::RowDescription { .. } => MessageKind::RowDescription,
            BackendMessage::FunctionCallResponse { .. } => MessageKind::FunctionCallResponse,
            BackendMessage::CopyBothResponse { .. } => MessageKind::CopyBothResponse,
            BackendMessage::ReadyForQuery { .. } => MessageKind::ReadyForQuery,
            BackendMessage::PortalSuspended => MessageKind::PortalSuspended,
        }
    }

    pub fn tag(&self) -> u8 {
        self.kind().tag()
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let tag = self.tag();
        let mut body = Vec::new();
        match self {
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::CopyDone
            | BackendMessage::EmptyQueryResponse
            | BackendMessage::NoData
            | BackendMessage::PortalSuspended => {}
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                put_u32(&mut body, *process_id);
                put_cstr(&mut body, channel);
                put_cstr(&mut body, payload);
            }
            BackendMessage::CopyFail { message } => put_cstr(&mut body, message),
            BackendMessage::CommandComplete { tag } => put_cstr(&mut body, tag),
            BackendMessage::CopyData { data } => body.extend_from_slice(data),
            BackendMessage::DataRow { values } => {
                put_count(&mut body, tag, values.len())?;
                for value in values {
                    put_nullable(&mut body, value.as_deref())?;
                }
            }
            BackendMessage::ErrorResponse(fields) | BackendMessage::NoticeResponse(fields) => {
                for (field, value) in &fields.0 {
                    body.push(*field);
                    put_cstr(&mut body, value);
                }
                body.push(0);
            }
            BackendMessage::CopyInResponse {
                format,
                column_formats,
            }
            | BackendMessage::CopyOutResponse {
                format,
                column_formats,
            }
            | BackendMessage::CopyBothResponse {
                format,
                column_formats,
            } => {
                body.push(*format);
                put_count(&mut body, tag, column_formats.len())?;
                for f in column_formats {
                    put_i16(&mut body, *f);
                }
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                put_u32(&mut body, *process_id);
                put_u32(&mut body, *secret_key);
            }
            BackendMessage::Authentication { code, data } => {
                put_u32(&mut body, *code);
                body.extend_from_slice(data);
            }
            BackendMessage::ParameterStatus { name, value } => {
                put_cstr(&mut body, name);
                put_cstr(&mut body, value);
            }
            BackendMessage::ParameterDescription { oids } => {
                put_count(&mut body, tag, oids.len())?;
                for oid in oids {
                    put_u32(&mut body, *oid);
                }
            }
            BackendMessage::RowDescription { fields } => {
                put_count(&mut body, tag, fields.len())?;
                for field in fields {
                    put_cstr(&mut body, &field.name);
                    put_u32(&mut body, field.table_oid);
                    put_i16(&mut body, field.column);
                    put_u32(&mut body, field.type_oid);
                    put_i16(&mut body, field.type_size);
                    put_i32(&mut body, field.type_modifier);
                    put_i16(&mut body, field.format);
                }
            }
            BackendMessage::FunctionCallResponse { result } => {
                put_nullable(&mut body, result.as_deref())?
            }
            BackendMessage::ReadyForQuery { status } => body.push(*status),
        }
        wire::frame(tag, &body)
    }

    /// Decodes a message body (everything after the length prefix).
    pub fn decode(tag: u8, body: &[u8]) -> Result<Self, DecodeError> {
        let kind = MessageKind::from_tag(tag).ok_or(DecodeError::UnknownTag(char::from(tag)))?;
        let mut r = Reader::new(tag, body);
        let msg = match kind {
            MessageKind::ParseComplete
            | MessageKind::BindComplete
            | MessageKind::CloseComplete
            | MessageKind::CopyDone
            | MessageKind::EmptyQueryResponse
            | MessageKind::NoData
            | MessageKind::PortalSuspended => BackendMessage::empty(kind),
            MessageKind::NotificationResponse => BackendMessage::NotificationResponse {
                process_id: r.u32()?,
                channel: r.cstr()?,
                payload: r.cstr()?,
            },
            MessageKind::CopyFail => BackendMessage::CopyFail { message: r.cstr()? },
            MessageKind::CommandComplete => BackendMessage::CommandComplete { tag: r.cstr()? },
            MessageKind::CopyData => BackendMessage::CopyData { data: r.rest() },
            MessageKind::DataRow => {
                let count = r.count()?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(r.nullable()?);
                }
                BackendMessage::DataRow { values }
            }
            MessageKind::ErrorResponse | MessageKind::NoticeResponse => {
                let mut fields = Vec::new();
                loop {
                    let field = r.u8()?;
                    if field == 0 {
                        break;
                    }
                    fields.push((field, r.cstr()?));
                }
                if kind == MessageKind::ErrorResponse {
                    BackendMessage::ErrorResponse(ErrorFields(fields))
                } else {
                    BackendMessage::NoticeResponse(ErrorFields(fields))
                }
            }
            MessageKind::CopyInResponse
            | MessageKind::CopyOutResponse
            | MessageKind::CopyBothResponse => {
                let format = r.u8()?;
                let count = r.count()?;
                let mut column_formats = Vec::with_capacity(count);
                for _ in 0..count {
                    column_formats.push(r.i16()?);
                }
                match kind {
                    MessageKind::CopyInResponse => BackendMessage::CopyInResponse {
                        format,
                        column_formats,
                    },
                    MessageKind::CopyOutResponse => BackendMessage::CopyOutResponse {
                        format,
                        column_formats,
                    },
                    _ => BackendMessage::CopyBothResponse {
                        format,
                        column_formats,
                    },
                }
            }
            MessageKind::BackendKeyData => BackendMessage::BackendKeyData {
                process_id: r.u32()?,
                secret_key: r.u32()?,
            },
            MessageKind::Authentication => BackendMessage::Authentication {
                code: r.u32()?,
                data: r.rest(),
            },
            MessageKind::ParameterStatus => BackendMessage::ParameterStatus {
                name: r.cstr()?,
                value: r.cstr()?,
            },
            MessageKind::ParameterDescription => {
                let count = r.count()?;
                let mut oids = Vec::with_capacity(count);
                for _ in 0..count {
                    oids.push(r.u32()?);
                }
                BackendMessage::ParameterDescription { oids }
            }
            MessageKind::RowDescription => {
                let count = r.count()?;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    fields.push(FieldDescription {
                        name: r.cstr()?,
                        table_oid: r.u32()?,
                        column: r.i16()?,
                        type_oid: r.u32()?,
                        type_size: r.i16()?,
                        type_modifier: r.i32()?,
                        format: r.i16()?,
                    });
                }
                BackendMessage::RowDescription { fields }
            }
            MessageKind::FunctionCallResponse => BackendMessage::FunctionCallResponse {
                result: r.nullable()?,
            },
            MessageKind::ReadyForQuery => BackendMessage::ReadyForQuery { status: r.u8()? },
        };
        r.finish()?;
        Ok(msg)
    }
}
