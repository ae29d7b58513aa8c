//! Profile-response parsing.
//!
//! Providers answer a profile call with a small line-oriented table: a
//! header whose tokens name fields, then one row per discovered child:
//!
//! ```text
//! address      mux   id          conns
//! 10.0.0.9     3306  orders-db   12
//! null         9000  billing     0
//! ```
//!
//! Recognized columns are `mux` (required), `address` (the literal `null`
//! drops the field), `id`, `conns` and `metadata` (comma-separated `k=v`
//! pairs). Each row becomes a `NodeTransport` stamped with the strategy's
//! protocol and resolved child provider.

use std::collections::BTreeMap;
use std::num::ParseIntError;

use thiserror::Error;
use tracing::debug;

use types::NodeTransport;

use crate::error::CatalogError;
use crate::strategy::ProfileStrategy;

#[derive(Debug, Error)]
pub enum ResponseParseError {
    #[error("protocol mux missing from profile strategy response row: {row:?}")]
    MissingMux { row: String },

    #[error("invalid connection count {value:?}: {source}")]
    InvalidConnectionCount {
        value: String,
        source: ParseIntError,
    },

    #[error("malformed metadata pair {pair:?}")]
    MalformedMetadata { pair: String },

    #[error(transparent)]
    ChildProvider(#[from] CatalogError),
}

/// Parse one provider response into transports. Fewer than two lines means
/// the strategy found nothing.
pub fn parse_profile_response(
    response: &str,
    strategy: &ProfileStrategy,
) -> Result<Vec<NodeTransport>, ResponseParseError> {
    let mut lines = response.lines();
    let Some(header) = lines.next() else {
        return Ok(vec![]);
    };
    let columns: Vec<&str> = header.split_whitespace().collect();

    let mut transports = vec![];
    for row in lines {
        if row.trim().is_empty() {
            continue;
        }
        transports.push(parse_row(&columns, row, strategy)?);
    }
    debug!(
        strategy = %strategy.name,
        count = transports.len(),
        "parsed profile results"
    );
    Ok(transports)
}

fn parse_row(
    columns: &[&str],
    row: &str,
    strategy: &ProfileStrategy,
) -> Result<NodeTransport, ResponseParseError> {
    let mut address = None;
    let mut mux = None;
    let mut debug_identifier = None;
    let mut num_connections = None;
    let mut metadata = BTreeMap::new();

    for (column, value) in columns.iter().zip(row.split_whitespace()) {
        match *column {
            "mux" => mux = Some(value.to_string()),
            "address" if value == "null" => {}
            "address" => address = Some(value.to_string()),
            "id" => debug_identifier = Some(value.to_string()),
            "conns" => {
                let conns = value.parse::<u64>().map_err(|e| {
                    ResponseParseError::InvalidConnectionCount {
                        value: value.to_string(),
                        source: e,
                    }
                })?;
                num_connections = Some(conns);
            }
            "metadata" => {
                for pair in value.split(',') {
                    let (k, v) =
                        pair.split_once('=')
                            .ok_or_else(|| ResponseParseError::MalformedMetadata {
                                pair: pair.to_string(),
                            })?;
                    metadata.insert(k.to_string(), v.to_string());
                }
            }
            _ => {}
        }
    }

    let mux = mux.ok_or_else(|| ResponseParseError::MissingMux {
        row: row.to_string(),
    })?;
    let assignment = strategy.determine_child_provider(&mux, address.as_deref())?;

    let mut transport = NodeTransport::new(
        &strategy.name,
        assignment.provider,
        strategy.protocol.clone(),
        &mux,
        address,
        strategy.is_hint(),
        debug_identifier,
        num_connections,
    );
    transport.metadata = metadata;
    transport.node_type = assignment.node_type;
    Ok(transport)
}
