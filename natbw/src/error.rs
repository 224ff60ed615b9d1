use thiserror::Error;

/// Vendor database errors
#[derive(Error, Debug)]
pub enum OuiError {
    /// Query is not six colon- or hyphen-separated hex octets
    #[error("invalid MAC address: {0}")]
    InvalidAddress(String),

    /// No address block survived parsing
    #[error("database is empty")]
    Empty,

    #[error("failed to read vendor database: {0}")]
    Io(#[from] std::io::Error),
}

/// Client registry ingest errors
#[derive(Error, Debug, PartialEq)]
pub enum IngestError {
    /// Counter record must have exactly one unspecified endpoint
    #[error("expected exactly one of source or destination to be unspecified: src={src} dst={dst}")]
    LocalIpAmbiguous { src: String, dst: String },
}

/// Text parsing errors for ARP, iptables and conntrack dumps
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("line contains less than {expected} fields: '{line}'")]
    ShortLine { expected: usize, line: String },

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("missing field '{field}' in '{line}'")]
    MissingField { field: &'static str, line: String },
}
