//! Tunnel Probe Binary
//!
//! Opens a tunneled PostgreSQL connection through an OpenShift gear, runs a
//! couple of queries and closes it again.
//!
//! Run with:
//!   OPENSHIFT_USER=me OPENSHIFT_PASSWORD=secret \
//!   cargo run --bin tunnel_probe -- \
//!     'openshiftproxy://openshift.redhat.com/app1?domain=ns1&cartridge=postgresql-9.2&driver=postgresql'
//!
//! `OPENSHIFT_SSH_KEY` optionally names the private key to use.

use anyhow::{Context, Result, anyhow};
use openshift_proxy::driver::{PRIVATE_KEY_PATH_KEY, PgDriver};
use openshift_proxy::{ConnectionProperties, ProxyDriver, TunnelConfig};
use sqlx::Row;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tunnel_probe=debug".parse()?)
                .add_directive("openshift_proxy=debug".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let descriptor = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: tunnel_probe <openshiftproxy://...>"))?;

    let mut properties = ConnectionProperties::new()
        .with("user", env("OPENSHIFT_USER")?)
        .with("password", env("OPENSHIFT_PASSWORD")?)
        .with("application_name", "tunnel_probe");
    if let Ok(key) = std::env::var("OPENSHIFT_SSH_KEY") {
        properties = properties.with(PRIVATE_KEY_PATH_KEY, key);
    }

    let driver = ProxyDriver::new(PgDriver::new(), TunnelConfig::load()?);

    println!("━━━ Connecting through tunnel ━━━");
    let mut connection = driver
        .connect(&descriptor, &properties)?
        .ok_or_else(|| anyhow!("{} is not an openshiftproxy descriptor", descriptor))?;
    println!("  ✓ Connected");

    smol::block_on(async {
        let row: (i32,) = sqlx::query_as("SELECT 1 + 1")
            .fetch_one(&mut *connection)
            .await?;
        println!("  ✓ SELECT 1 + 1 = {}", row.0);

        let row = sqlx::query("SELECT version()")
            .fetch_one(&mut *connection)
            .await?;
        let version: String = row.get(0);
        println!(
            "  ✓ PostgreSQL version: {}",
            version.split(',').next().unwrap_or(&version)
        );
        Ok::<_, anyhow::Error>(())
    })?;

    connection.close()?;
    println!("  ✓ Tunnel closed cleanly");
    Ok(())
}

fn env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} must be set", name))
}
