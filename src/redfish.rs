use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

#[derive(Deserialize)]
struct SessionCollection {
    #[serde(rename = "Members", default)]
    members: Vec<SessionMember>,
}

#[derive(Deserialize)]
struct SessionMember {
    #[serde(rename = "@odata.id")]
    odata_id: String,
}

/// Best-effort sweep of orphaned Redfish sessions on a BMC.
///
/// Lists `/redfish/v1/Sessions` with basic auth (TLS verification disabled:
/// BMC certificates are self-signed) and deletes each member. BMCs without
/// Redfish simply fail to respond; every failure here is silent because this
/// is purely a courtesy to recover from previous dirty shutdowns.
pub async fn clear_sessions(host: String, username: String, password: String) {
    let Ok(client) = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(5))
        .build()
    else {
        return;
    };

    let sessions_url = format!("https://{host}/redfish/v1/Sessions");
    let resp = match client
        .get(&sessions_url)
        .basic_auth(&username, Some(&password))
        .send()
        .await
    {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            debug!(host = %host, status = %r.status(), "redfish session list refused");
            return;
        }
        Err(_) => return,
    };

    let Ok(collection) = resp.json::<SessionCollection>().await else {
        return;
    };

    let mut cleared = 0u32;
    for member in collection.members {
        let delete_url = format!("https://{host}{}", member.odata_id);
        if client
            .delete(&delete_url)
            .basic_auth(&username, Some(&password))
            .send()
            .await
            .is_ok()
        {
            cleared += 1;
        }
    }

    if cleared > 0 {
        info!(host = %host, cleared, "cleared stale BMC sessions");
    }
}
