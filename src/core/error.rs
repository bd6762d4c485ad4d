use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    InvalidPolicy,
    Visibility,
    ColumnAppend,
    SchemaMismatch,
    WriteConflict,
    Busy,
    Corrupt,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Internal => "Internal",
            ErrorKind::Usage => "Usage",
            ErrorKind::InvalidPolicy => "InvalidPolicy",
            ErrorKind::Visibility => "Visibility",
            ErrorKind::ColumnAppend => "ColumnAppend",
            ErrorKind::SchemaMismatch => "SchemaMismatch",
            ErrorKind::WriteConflict => "WriteConflict",
            ErrorKind::Busy => "Busy",
            ErrorKind::Corrupt => "Corrupt",
            ErrorKind::Io => "Io",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        let kind = match kind {
            "Internal" => ErrorKind::Internal,
            "Usage" => ErrorKind::Usage,
            "InvalidPolicy" => ErrorKind::InvalidPolicy,
            "Visibility" => ErrorKind::Visibility,
            "ColumnAppend" => ErrorKind::ColumnAppend,
            "SchemaMismatch" => ErrorKind::SchemaMismatch,
            "WriteConflict" => ErrorKind::WriteConflict,
            "Busy" => ErrorKind::Busy,
            "Corrupt" => ErrorKind::Corrupt,
            "Io" => ErrorKind::Io,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    block: Option<u64>,
    slot: Option<u32>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            block: None,
            slot: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn block(&self) -> Option<u64> {
        self.block
    }

    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_block(mut self, block: u64) -> Self {
        self.block = Some(block);
        self
    }

    pub fn with_slot(mut self, slot: u32) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(block) = self.block {
            write!(f, " (block: {block})")?;
        }
        if let Some(slot) = self.slot {
            write!(f, " (slot: {slot})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::InvalidPolicy => 3,
        ErrorKind::Visibility => 4,
        ErrorKind::ColumnAppend => 5,
        ErrorKind::SchemaMismatch => 6,
        ErrorKind::WriteConflict => 7,
        ErrorKind::Busy => 8,
        ErrorKind::Corrupt => 9,
        ErrorKind::Io => 10,
    }
}
