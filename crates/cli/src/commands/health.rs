//! Service health command

use anyhow::Result;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_state, print_items, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Show overall and per-component health
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }

    println!("Service: {}", color_state(&health.status));
    let components: Vec<_> = health.components.into_iter().collect();
    print_items(
        &components,
        |(name, component)| ComponentRow {
            name: name.clone(),
            status: color_state(&component.status),
            message: component.message.clone().unwrap_or_default(),
        },
        format,
    )
}
