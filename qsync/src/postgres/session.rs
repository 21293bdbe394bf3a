use chrono::{DateTime, Utc};
use pg_escape::quote_literal;
use qsync_config::shared::{IntoConnectOptions, PgConnectionConfig, TlsConfig};
use rustls::ClientConfig;
use std::fmt;
use std::io::BufReader;
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{
    Client, Config, Connection, NoTls, SimpleQueryMessage, SimpleQueryRow, Socket,
};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, debug, error, info};

use crate::bail;
use crate::catalog::TableListEntry;
use crate::compare::TableChecksum;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::session::{DataSession, LockSession, QueueAdmin};
use crate::sync_error;
use crate::types::{ConsumerInfo, NodeInfo, TableName, TickId};

/// Return code of the queue functions for an unknown object.
const RET_CODE_NOT_FOUND: i64 = 404;

/// Spawns a background task driving a Postgres connection until it terminates.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        if let Err(e) = connection.await {
            error!("an error occurred during the Postgres connection: {}", e);
            return;
        }

        info!("postgres connection terminated successfully")
    }
    .instrument(span);

    tokio::spawn(task);
}

/// A single Postgres connection used as one of the sessions of a run.
///
/// Statements are sent with the simple query protocol, so that transaction control and
/// the queue functions behave exactly as in an interactive session.
#[derive(Debug)]
pub struct PgSession {
    client: Client,
}

impl PgSession {
    /// Connects to the database of `config`, with TLS if it is enabled.
    pub async fn connect(config: &PgConnectionConfig) -> SyncResult<Self> {
        Self::connect_with(config.with_db(), &config.tls).await
    }

    /// Connects with prepared connect options, with TLS if `tls` is enabled.
    pub async fn connect_with(options: Config, tls: &TlsConfig) -> SyncResult<Self> {
        match tls.enabled {
            true => Self::connect_tls(options, tls).await,
            false => Self::connect_no_tls(options).await,
        }
    }

    async fn connect_no_tls(options: Config) -> SyncResult<Self> {
        let (client, connection) = options.connect(NoTls).await?;
        spawn_postgres_connection::<NoTls>(connection);

        info!("successfully connected to postgres without tls");

        Ok(PgSession { client })
    }

    async fn connect_tls(options: Config, tls: &TlsConfig) -> SyncResult<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        let mut root_certs_reader = BufReader::new(tls.trusted_root_certs.as_bytes());
        for cert in rustls_pemfile::certs(&mut root_certs_reader) {
            let cert = cert?;
            root_store.add(cert)?;
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let (client, connection) = options.connect(MakeRustlsConnect::new(tls_config)).await?;
        spawn_postgres_connection::<MakeRustlsConnect>(connection);

        info!("successfully connected to postgres with tls");

        Ok(PgSession { client })
    }

    /// Returns the row count and the sum of row hashes of `table`, in the current
    /// transaction.
    pub async fn table_checksum(&self, table: &TableName) -> SyncResult<TableChecksum> {
        let query = format!(
            "select count(1) as cnt, coalesce(sum(hashtext(t.*::text)), 0) as chksum \
             from only {} t;",
            table.as_quoted_identifier()
        );

        let row = self.query_one(&query, "table checksum").await?;

        Ok(TableChecksum {
            row_count: get_row_value(&row, "cnt", "table checksum")?,
            checksum: get_row_value(&row, "chksum", "table checksum")?,
        })
    }

    async fn query_rows(&self, query: &str) -> SyncResult<Vec<SimpleQueryRow>> {
        let rows = self
            .client
            .simple_query(query)
            .await?
            .into_iter()
            .filter_map(|msg| match msg {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .collect();

        Ok(rows)
    }

    async fn query_opt(&self, query: &str) -> SyncResult<Option<SimpleQueryRow>> {
        Ok(self.query_rows(query).await?.into_iter().next())
    }

    async fn query_one(&self, query: &str, context: &str) -> SyncResult<SimpleQueryRow> {
        self.query_opt(query).await?.ok_or_else(|| {
            sync_error!(
                ErrorKind::QueryFailed,
                "Query returned no rows",
                format!("expected a row for {context}")
            )
        })
    }

    async fn execute(&self, query: &str) -> SyncResult<()> {
        self.client.simple_query(query).await?;

        Ok(())
    }
}

impl QueueAdmin for PgSession {
    async fn node_info(&self, queue_name: &str) -> SyncResult<Option<NodeInfo>> {
        let query = format!(
            "select ret_code, ret_note, node_name, node_type, worker_name, provider_location \
             from pgq_node.get_node_info({});",
            quote_literal(queue_name)
        );

        let row = self.query_one(&query, "pgq_node.get_node_info").await?;
        let ret_code: i64 = get_row_value(&row, "ret_code", "pgq_node.get_node_info")?;
        if ret_code == RET_CODE_NOT_FOUND {
            return Ok(None);
        }
        check_ret_code(&row, ret_code, "pgq_node.get_node_info")?;

        let node_type: String = get_row_value(&row, "node_type", "pgq_node.get_node_info")?;

        Ok(Some(NodeInfo {
            node_name: get_row_value(&row, "node_name", "pgq_node.get_node_info")?,
            node_type: node_type.parse()?,
            worker_name: get_optional_row_value(&row, "worker_name", "pgq_node.get_node_info")?,
            provider_location: get_optional_row_value(
                &row,
                "provider_location",
                "pgq_node.get_node_info",
            )?,
        }))
    }

    async fn consumer_info(
        &self,
        queue_name: &str,
        consumer_name: &str,
    ) -> SyncResult<Option<ConsumerInfo>> {
        let query = format!(
            "select extract(epoch from q.ticker_lag)::float8 as ticker_lag, \
             extract(epoch from c.lag)::float8 as consumer_lag, c.last_tick, \
             extract(epoch from now())::float8 as observed_at \
             from pgq.get_queue_info({queue}) q, pgq.get_consumer_info({queue}, {consumer}) c;",
            queue = quote_literal(queue_name),
            consumer = quote_literal(consumer_name)
        );

        let Some(row) = self.query_opt(&query).await? else {
            return Ok(None);
        };

        let ticker_lag: Option<f64> =
            get_optional_row_value(&row, "ticker_lag", "pgq.get_consumer_info")?;
        let consumer_lag: Option<f64> =
            get_optional_row_value(&row, "consumer_lag", "pgq.get_consumer_info")?;
        let observed_at: f64 = get_row_value(&row, "observed_at", "pgq.get_consumer_info")?;

        Ok(Some(ConsumerInfo {
            ticker_lag: secs_to_duration(ticker_lag.unwrap_or_default())?,
            consumer_lag: consumer_lag.map(secs_to_duration).transpose()?,
            last_tick: get_optional_row_value(&row, "last_tick", "pgq.get_consumer_info")?,
            observed_at: epoch_to_datetime(observed_at)?,
        }))
    }

    async fn ticker_lag(&self, queue_name: &str) -> SyncResult<Duration> {
        let query = format!(
            "select extract(epoch from ticker_lag)::float8 as ticker_lag \
             from pgq.get_queue_info({});",
            quote_literal(queue_name)
        );

        let Some(row) = self.query_opt(&query).await? else {
            bail!(
                ErrorKind::InvalidState,
                "Queue does not exist",
                format!("queue '{queue_name}' not found")
            );
        };
        let ticker_lag: Option<f64> =
            get_optional_row_value(&row, "ticker_lag", "pgq.get_queue_info")?;

        secs_to_duration(ticker_lag.unwrap_or_default())
    }

    async fn force_tick(&self, queue_name: &str) -> SyncResult<TickId> {
        let query = format!(
            "select pgq.force_tick({}) as tick_id;",
            quote_literal(queue_name)
        );

        let row = self.query_one(&query, "pgq.force_tick").await?;

        get_row_value(&row, "tick_id", "pgq.force_tick")
    }

    async fn server_time(&self) -> SyncResult<DateTime<Utc>> {
        let row = self
            .query_one(
                "select extract(epoch from now())::float8 as now;",
                "server time",
            )
            .await?;
        let now: f64 = get_row_value(&row, "now", "server time")?;

        epoch_to_datetime(now)
    }

    async fn set_consumer_paused(
        &self,
        queue_name: &str,
        consumer_name: &str,
        paused: bool,
    ) -> SyncResult<()> {
        let query = format!(
            "select ret_code, ret_note from pgq_node.set_consumer_paused({}, {}, {});",
            quote_literal(queue_name),
            quote_literal(consumer_name),
            paused
        );

        let row = self.query_one(&query, "pgq_node.set_consumer_paused").await?;
        let ret_code: i64 = get_row_value(&row, "ret_code", "pgq_node.set_consumer_paused")?;
        check_ret_code(&row, ret_code, "pgq_node.set_consumer_paused")?;

        Ok(())
    }

    async fn consumer_uptodate(&self, queue_name: &str, consumer_name: &str) -> SyncResult<bool> {
        let query = format!(
            "select ret_code, ret_note, uptodate from pgq_node.get_consumer_state({}, {});",
            quote_literal(queue_name),
            quote_literal(consumer_name)
        );

        let row = self.query_one(&query, "pgq_node.get_consumer_state").await?;
        let ret_code: i64 = get_row_value(&row, "ret_code", "pgq_node.get_consumer_state")?;
        check_ret_code(&row, ret_code, "pgq_node.get_consumer_state")?;

        get_bool_row_value(&row, "uptodate", "pgq_node.get_consumer_state")
    }
}

impl DataSession for PgSession {
    async fn table_list(&self, queue_name: &str) -> SyncResult<Vec<TableListEntry>> {
        let query = format!(
            "select table_name, merge_state, dest_table, table_attrs \
             from londiste.get_table_list({}) where local;",
            quote_literal(queue_name)
        );

        let mut entries = Vec::new();
        for row in self.query_rows(&query).await? {
            entries.push(TableListEntry {
                table_name: get_row_value(&row, "table_name", "londiste.get_table_list")?,
                merge_state: get_optional_row_value(
                    &row,
                    "merge_state",
                    "londiste.get_table_list",
                )?,
                dest_table: get_optional_row_value(&row, "dest_table", "londiste.get_table_list")?,
                table_attrs: get_optional_row_value(
                    &row,
                    "table_attrs",
                    "londiste.get_table_list",
                )?,
            });
        }

        Ok(entries)
    }

    async fn table_exists(&self, table: &TableName) -> SyncResult<bool> {
        let query = format!(
            "select exists (select 1 from pg_catalog.pg_class t \
             join pg_catalog.pg_namespace s on t.relnamespace = s.oid \
             where s.nspname = {} and t.relname = {}) as exists;",
            quote_literal(&table.schema),
            quote_literal(&table.name)
        );

        let row = self.query_one(&query, "table existence").await?;

        get_bool_row_value(&row, "exists", "table existence")
    }

    async fn begin_snapshot(&self) -> SyncResult<()> {
        self.execute("commit; begin isolation level repeatable read; select 1;")
            .await
    }

    async fn commit(&self) -> SyncResult<()> {
        self.execute("commit;").await
    }
}

impl LockSession for PgSession {
    async fn lock_table(&self, table: &TableName, statement_timeout: Duration) -> SyncResult<()> {
        let mut query = String::from("begin; ");
        if !statement_timeout.is_zero() {
            query.push_str(&format!(
                "set local statement_timeout = {}; ",
                statement_timeout.as_millis()
            ));
        }
        query.push_str(&format!(
            "lock table {} in share mode;",
            table.as_quoted_identifier()
        ));

        if let Err(err) = self.execute(&query).await {
            debug!(table = %table, error = %err, "lock failed, rolling back");
            if let Err(rollback_err) = self.execute("rollback;").await {
                return Err(SyncError::many(vec![err, rollback_err]));
            }
            return Err(err);
        }

        Ok(())
    }

    async fn unlock(&self) -> SyncResult<()> {
        self.execute("commit;").await
    }

    async fn abort(&self) -> SyncResult<()> {
        self.execute("rollback;").await
    }
}

fn check_ret_code(row: &SimpleQueryRow, ret_code: i64, function: &str) -> SyncResult<()> {
    if ret_code >= 400 {
        let ret_note: Option<String> = get_optional_row_value(row, "ret_note", function)?;
        bail!(
            ErrorKind::CommandFailed,
            "Queue function returned an error",
            format!(
                "{function} returned {ret_code}: {}",
                ret_note.unwrap_or_default()
            )
        );
    }

    Ok(())
}

fn secs_to_duration(secs: f64) -> SyncResult<Duration> {
    Duration::try_from_secs_f64(secs.max(0.0)).map_err(|err| {
        sync_error!(
            ErrorKind::ConversionError,
            "Interval is not a valid duration",
            format!("{secs} seconds: {err}")
        )
    })
}

fn epoch_to_datetime(epoch: f64) -> SyncResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros((epoch * 1_000_000.0).round() as i64).ok_or_else(|| {
        sync_error!(
            ErrorKind::ConversionError,
            "Timestamp is out of range",
            format!("epoch {epoch}")
        )
    })
}

/// Extracts a non-null value from a row and parses it.
fn get_row_value<T: FromStr>(row: &SimpleQueryRow, column_name: &str, context: &str) -> SyncResult<T>
where
    T::Err: fmt::Debug,
{
    get_optional_row_value(row, column_name, context)?.ok_or_else(|| {
        sync_error!(
            ErrorKind::SchemaError,
            "Column is null",
            format!("column '{column_name}' of {context} is null")
        )
    })
}

/// Extracts a nullable value from a row and parses it.
fn get_optional_row_value<T: FromStr>(
    row: &SimpleQueryRow,
    column_name: &str,
    context: &str,
) -> SyncResult<Option<T>>
where
    T::Err: fmt::Debug,
{
    let Some(value) = row.try_get(column_name)? else {
        return Ok(None);
    };

    value.parse().map(Some).map_err(|e: T::Err| {
        sync_error!(
            ErrorKind::ConversionError,
            "Column parsing failed",
            format!("failed to parse column '{column_name}' of {context}: {e:?}")
        )
    })
}

/// Extracts a boolean, which the simple query protocol sends as `t` or `f`.
fn get_bool_row_value(row: &SimpleQueryRow, column_name: &str, context: &str) -> SyncResult<bool> {
    let value: String = get_row_value(row, column_name, context)?;
    match value.as_str() {
        "t" => Ok(true),
        "f" => Ok(false),
        other => bail!(
            ErrorKind::ConversionError,
            "Column is not a boolean",
            format!("column '{column_name}' of {context} has value '{other}'")
        ),
    }
}
