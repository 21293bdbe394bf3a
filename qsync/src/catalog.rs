use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::session::DataSession;
use crate::sync_error;
use crate::types::TableName;

/// Attribute naming the replay handler of a table.
pub const HANDLER_ATTRIBUTE: &str = "handler";

/// Raw row of the replication catalog of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableListEntry {
    pub table_name: String,
    pub merge_state: Option<String>,
    pub dest_table: Option<String>,
    pub table_attrs: Option<String>,
}

/// Replay state of a table on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeState {
    /// Fully synchronized, changes are applied as they arrive.
    Ok,
    /// Initial copy or catch-up still in progress, e.g. `in-copy` or `catching-up`.
    Other(String),
    /// The table was added but never started syncing.
    Unset,
}

impl MergeState {
    pub fn is_ok(&self) -> bool {
        matches!(self, MergeState::Ok)
    }
}

impl From<Option<String>> for MergeState {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(state) if state == "ok" => MergeState::Ok,
            Some(state) => MergeState::Other(state),
            None => MergeState::Unset,
        }
    }
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeState::Ok => write!(f, "ok"),
            MergeState::Other(state) => write!(f, "{state}"),
            MergeState::Unset => write!(f, "unset"),
        }
    }
}

/// A table replicated through the queue, as known to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedTable {
    pub table_name: TableName,
    /// Physical table the changes land in, the table itself unless renamed.
    pub dest_table: TableName,
    pub merge_state: MergeState,
    pub attributes: HashMap<String, String>,
}

impl ReplicatedTable {
    /// Returns the replay handler configured for the table, if any.
    pub fn handler(&self) -> Option<&str> {
        self.attributes.get(HANDLER_ATTRIBUTE).map(String::as_str)
    }
}

impl TryFrom<TableListEntry> for ReplicatedTable {
    type Error = SyncError;

    fn try_from(entry: TableListEntry) -> Result<Self, Self::Error> {
        let table_name = TableName::parse(&entry.table_name);
        let dest_table = entry
            .dest_table
            .as_deref()
            .map(TableName::parse)
            .unwrap_or_else(|| table_name.clone());

        let attributes = match entry.table_attrs.as_deref() {
            Some(attrs) if !attrs.is_empty() => decode_attributes(attrs).map_err(|err| {
                sync_error!(
                    ErrorKind::InvalidData,
                    "Table attributes could not be decoded",
                    format!("table {table_name}: {err}")
                )
            })?,
            _ => HashMap::new(),
        };

        Ok(Self {
            table_name,
            dest_table,
            merge_state: entry.merge_state.into(),
            attributes,
        })
    }
}

fn decode_attributes(attrs: &str) -> SyncResult<HashMap<String, String>> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(attrs)?;

    Ok(pairs.into_iter().collect())
}

/// Tables replicated locally on one node, in catalog order.
#[derive(Debug, Clone, Default)]
pub struct TableCatalog {
    tables: HashMap<TableName, ReplicatedTable>,
    names: Vec<TableName>,
}

impl TableCatalog {
    /// Reads the catalog of `queue_name` through `session` and ends the transaction.
    pub async fn load<D: DataSession>(session: &D, queue_name: &str) -> SyncResult<Self> {
        let entries = session.table_list(queue_name).await?;
        session.commit().await?;

        let catalog = Self::from_entries(entries)?;
        debug!(queue_name, tables = catalog.len(), "loaded table catalog");

        Ok(catalog)
    }

    pub fn from_entries(entries: Vec<TableListEntry>) -> SyncResult<Self> {
        let mut catalog = Self::default();
        for entry in entries {
            let table = ReplicatedTable::try_from(entry)?;
            if !catalog.tables.contains_key(&table.table_name) {
                catalog.names.push(table.table_name.clone());
            }
            catalog.tables.insert(table.table_name.clone(), table);
        }

        Ok(catalog)
    }

    pub fn get(&self, name: &TableName) -> Option<&ReplicatedTable> {
        self.tables.get(name)
    }

    pub fn names(&self) -> &[TableName] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, merge_state: Option<&str>) -> TableListEntry {
        TableListEntry {
            table_name: name.to_owned(),
            merge_state: merge_state.map(str::to_owned),
            dest_table: None,
            table_attrs: None,
        }
    }

    #[test]
    fn test_dest_table_defaults_to_table_name() {
        let table = ReplicatedTable::try_from(entry("public.a", Some("ok"))).unwrap();
        assert_eq!(table.dest_table, TableName::parse("public.a"));
        assert!(table.merge_state.is_ok());
        assert!(table.handler().is_none());
    }

    #[test]
    fn test_renamed_dest_table() {
        let mut entry = entry("public.a", Some("ok"));
        entry.dest_table = Some("archive.a_copy".to_owned());

        let table = ReplicatedTable::try_from(entry).unwrap();
        assert_eq!(table.table_name, TableName::parse("public.a"));
        assert_eq!(table.dest_table, TableName::parse("archive.a_copy"));
    }

    #[test]
    fn test_attributes_are_url_decoded() {
        let mut entry = entry("public.a", Some("ok"));
        entry.table_attrs = Some("handler=bulk&key=a%2Cb&note=two+words".to_owned());

        let table = ReplicatedTable::try_from(entry).unwrap();
        assert_eq!(table.handler(), Some("bulk"));
        assert_eq!(table.attributes["key"], "a,b");
        assert_eq!(table.attributes["note"], "two words");
    }

    #[test]
    fn test_merge_states() {
        assert_eq!(MergeState::from(Some("ok".to_owned())), MergeState::Ok);
        assert_eq!(
            MergeState::from(Some("syncing".to_owned())),
            MergeState::Other("syncing".to_owned())
        );
        assert_eq!(MergeState::from(None), MergeState::Unset);
        assert_eq!(MergeState::Unset.to_string(), "unset");
    }

    #[test]
    fn test_catalog_keeps_order_and_normalises_names() {
        let catalog = TableCatalog::from_entries(vec![
            entry("b", Some("ok")),
            entry("public.a", None),
            entry("other.c", Some("in-copy")),
        ])
        .unwrap();

        assert_eq!(
            catalog.names(),
            &[
                TableName::parse("public.b"),
                TableName::parse("public.a"),
                TableName::parse("other.c"),
            ]
        );
        assert_eq!(
            catalog.get(&TableName::parse("b")).unwrap().merge_state,
            MergeState::Ok
        );
        assert!(catalog.get(&TableName::parse("c")).is_none());
    }
}
