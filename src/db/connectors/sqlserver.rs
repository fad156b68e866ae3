use super::{QueryError, SqlServerConfig};
use crate::db::scalar::ScalarValue;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

pub type SqlClient = Client<Compat<TcpStream>>;

/// Build a tiberius Config from our SqlServerConfig.
///
/// Recognised options: `encrypt`, `TrustServerCertificate` and `app name`.
/// Other options only take part in the pool key.
pub fn build_tiberius_config(config: &SqlServerConfig) -> Config {
    let mut tib_config = Config::new();

    tib_config.host(&config.server);
    tib_config.port(config.port);

    if !config.database.is_empty() {
        tib_config.database(&config.database);
    }

    if config.user.is_empty() {
        tib_config.authentication(AuthMethod::None);
    } else {
        tib_config.authentication(AuthMethod::sql_server(&config.user, &config.password));
    }

    match config.option("encrypt").as_deref() {
        Some("false") => tib_config.encryption(EncryptionLevel::Off),
        Some("disable") => tib_config.encryption(EncryptionLevel::NotSupported),
        _ => tib_config.encryption(EncryptionLevel::Required),
    }

    if config.option("TrustServerCertificate").as_deref() == Some("true") {
        tib_config.trust_cert();
    }

    if let Some(name) = config
        .option("app name")
        .or_else(|| config.option("ApplicationName"))
    {
        tib_config.application_name(name);
    }

    for key in config.options.keys() {
        let known = ["encrypt", "trustservercertificate", "app name", "applicationname"];
        if !known.contains(&key.to_lowercase().as_str()) {
            log::debug!("SQL Server option '{}' is not applied to the TDS client", key);
        }
    }

    tib_config
}

/// Open one TDS client.
pub async fn open_client(config: &Config) -> Result<SqlClient, tiberius::error::Error> {
    let tcp = TcpStream::connect(config.get_addr()).await?;
    tcp.set_nodelay(true)?;
    Client::connect(config.clone(), tcp.compat_write()).await
}

/// Cheapest round trip the server will answer.
pub async fn ping(client: &mut SqlClient) -> Result<(), tiberius::error::Error> {
    client.simple_query("SELECT 1").await?.into_results().await?;
    Ok(())
}

/// Run `sql` and return the single value of its first row.
pub async fn query_scalar(client: &mut SqlClient, sql: &str) -> Result<ScalarValue, QueryError> {
    let stream = client
        .simple_query(sql)
        .await
        .map_err(|e| QueryError::Execution(e.to_string()))?;
    let row = stream
        .into_row()
        .await
        .map_err(|e| QueryError::Execution(e.to_string()))?
        .ok_or(QueryError::NoRows)?;

    if row.len() != 1 {
        return Err(QueryError::ColumnCount(row.len()));
    }

    match row.into_iter().next() {
        Some(data) => Ok(column_to_scalar(data)),
        None => Err(QueryError::ColumnCount(0)),
    }
}

/// Whether an error leaves the client unusable (transport level) as opposed
/// to a server-side rejection of the statement.
pub fn is_fatal(error: &tiberius::error::Error) -> bool {
    !matches!(error, tiberius::error::Error::Server(_))
}

/// Convert one tiberius column value into a ScalarValue.
pub fn column_to_scalar(data: ColumnData<'static>) -> ScalarValue {
    match data {
        ColumnData::Bit(Some(v)) => ScalarValue::Bool(v),
        ColumnData::U8(Some(v)) => ScalarValue::Int(v as i64),
        ColumnData::I16(Some(v)) => ScalarValue::Int(v as i64),
        ColumnData::I32(Some(v)) => ScalarValue::Int(v as i64),
        ColumnData::I64(Some(v)) => ScalarValue::Int(v),
        ColumnData::F32(Some(v)) => ScalarValue::Float(v as f64),
        ColumnData::F64(Some(v)) => ScalarValue::Float(v),
        ColumnData::Numeric(Some(n)) => {
            ScalarValue::Float(n.value() as f64 / 10f64.powi(n.scale() as i32))
        }
        ColumnData::String(Some(s)) => ScalarValue::Text(s.into_owned()),
        ColumnData::Binary(Some(b)) => ScalarValue::Bytes(b.into_owned()),
        ColumnData::Bit(None)
        | ColumnData::U8(None)
        | ColumnData::I16(None)
        | ColumnData::I32(None)
        | ColumnData::I64(None)
        | ColumnData::F32(None)
        | ColumnData::F64(None)
        | ColumnData::Numeric(None)
        | ColumnData::String(None)
        | ColumnData::Binary(None) => ScalarValue::Null,
        ColumnData::Guid(_) => ScalarValue::Unsupported("uniqueidentifier"),
        ColumnData::Xml(_) => ScalarValue::Unsupported("xml"),
        _ => ScalarValue::Unsupported("date/time"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use tiberius::numeric::Numeric;

    #[test]
    fn test_build_config_uses_host_and_port() {
        let cfg = SqlServerConfig {
            server: "db.internal".into(),
            port: 14330,
            user: "sa".into(),
            password: "secret".into(),
            database: "master".into(),
            ..Default::default()
        };
        let tib = build_tiberius_config(&cfg);
        assert_eq!(tib.get_addr(), "db.internal:14330");
    }

    #[test]
    fn test_column_to_scalar_numbers() {
        assert_eq!(column_to_scalar(ColumnData::Bit(Some(true))), ScalarValue::Bool(true));
        assert_eq!(column_to_scalar(ColumnData::U8(Some(7))), ScalarValue::Int(7));
        assert_eq!(column_to_scalar(ColumnData::I16(Some(-2))), ScalarValue::Int(-2));
        assert_eq!(column_to_scalar(ColumnData::I32(Some(1))), ScalarValue::Int(1));
        assert_eq!(column_to_scalar(ColumnData::I64(Some(0))), ScalarValue::Int(0));
        assert_eq!(column_to_scalar(ColumnData::F64(Some(0.0))), ScalarValue::Float(0.0));
    }

    #[test]
    fn test_column_to_scalar_numeric_scale() {
        let n = Numeric::new_with_scale(1250, 2);
        assert_eq!(column_to_scalar(ColumnData::Numeric(Some(n))), ScalarValue::Float(12.5));
    }

    #[test]
    fn test_column_to_scalar_text_and_binary() {
        assert_eq!(
            column_to_scalar(ColumnData::String(Some(Cow::Borrowed("TRUE")))),
            ScalarValue::Text("TRUE".into())
        );
        assert_eq!(
            column_to_scalar(ColumnData::Binary(Some(Cow::Owned(b"Y".to_vec())))),
            ScalarValue::Bytes(b"Y".to_vec())
        );
    }

    #[test]
    fn test_column_to_scalar_nulls() {
        assert_eq!(column_to_scalar(ColumnData::I32(None)), ScalarValue::Null);
        assert_eq!(column_to_scalar(ColumnData::String(None)), ScalarValue::Null);
        assert!(column_to_scalar(ColumnData::Guid(None)).to_bool().is_err());
    }
}
