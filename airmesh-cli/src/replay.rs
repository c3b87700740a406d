//! Store event feed: newline-delimited JSON rows applied to the in-memory
//! store. This is how deployments without a live schema-database monitor
//! (and the integration tests of record) drive the reconcilers.

use anyhow::{bail, Context};
use serde::Deserialize;

use airmesh_store::{
    ConnectionManagerUplink, Store, WifiInetConfig, WifiInetState, WifiMasterState, WifiVifState,
};

#[derive(Debug, Deserialize)]
pub struct ReplayLine {
    pub table: String,
    #[serde(default = "default_op")]
    pub op: String,
    pub row: serde_json::Value,
}

fn default_op() -> String {
    "upsert".to_string()
}

fn key_of(row: &serde_json::Value) -> anyhow::Result<String> {
    row.get("if_name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .context("row is missing if_name")
}

pub fn apply_line(store: &mut Store, line: &str) -> anyhow::Result<()> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(());
    }
    let parsed: ReplayLine = serde_json::from_str(line).context("parsing replay line")?;
    let delete = match parsed.op.as_str() {
        "upsert" => false,
        "delete" => true,
        other => bail!("unknown op '{other}'"),
    };

    match parsed.table.as_str() {
        "Wifi_VIF_State" => {
            if delete {
                store.delete_vif_state(&key_of(&parsed.row)?);
            } else {
                store.upsert_vif_state(serde_json::from_value::<WifiVifState>(parsed.row)?);
            }
        }
        "Wifi_Master_State" => {
            if delete {
                store.delete_master_state(&key_of(&parsed.row)?);
            } else {
                store.upsert_master_state(serde_json::from_value::<WifiMasterState>(parsed.row)?);
            }
        }
        "Wifi_Inet_State" => {
            if delete {
                store.delete_inet_state(&key_of(&parsed.row)?);
            } else {
                store.upsert_inet_state(serde_json::from_value::<WifiInetState>(parsed.row)?);
            }
        }
        "Wifi_Inet_Config" => {
            if delete {
                store.delete_inet_config(&key_of(&parsed.row)?);
            } else {
                store.upsert_inet_config(serde_json::from_value::<WifiInetConfig>(parsed.row)?);
            }
        }
        "Connection_Manager_Uplink" => {
            if delete {
                store.delete_uplink(&key_of(&parsed.row)?);
            } else {
                store
                    .insert_uplink(serde_json::from_value::<ConnectionManagerUplink>(parsed.row)?)
                    .ok();
            }
        }
        other => bail!("unknown table '{other}'"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_upserts_and_deletes() {
        let mut store = Store::new();
        apply_line(
            &mut store,
            r#"{"table":"Wifi_VIF_State","row":{"if_name":"bhaul-sta-5","mode":"sta","wds":true}}"#,
        )
        .unwrap();
        apply_line(
            &mut store,
            r#"{"table":"Wifi_Master_State","row":{"if_name":"bhaul-sta-5","port_state":"active"}}"#,
        )
        .unwrap();
        assert_eq!(store.drain_events().len(), 2);

        apply_line(
            &mut store,
            r#"{"table":"Wifi_VIF_State","op":"delete","row":{"if_name":"bhaul-sta-5"}}"#,
        )
        .unwrap();
        assert_eq!(store.drain_events().len(), 1);
    }

    #[test]
    fn skips_comments_and_blanks() {
        let mut store = Store::new();
        apply_line(&mut store, "# comment").unwrap();
        apply_line(&mut store, "   ").unwrap();
        assert!(!store.has_events());
    }

    #[test]
    fn rejects_unknown_tables() {
        let mut store = Store::new();
        assert!(apply_line(&mut store, r#"{"table":"Nope","row":{}}"#).is_err());
    }
}
