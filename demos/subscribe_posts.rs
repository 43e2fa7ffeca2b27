use std::error::Error;

use pocketbase_sdk::realtime::proto::EventAction;
use pocketbase_sdk::records::{Collection, Record};
use pocketbase_sdk::{AuthMethod, Client, SecretString};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let base_url = "http://127.0.0.1:8090".to_string();
    let identity = "REPLACE_WITH_ADMIN_EMAIL".to_string();
    let password = "REPLACE_WITH_ADMIN_PASSWORD".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = Client::with_auth(
            base_url,
            AuthMethod::admin_password(identity, SecretString::new(password)),
        )?;
        let posts: Collection<Record> = Collection::new(&client, "posts");

        let subscription = posts.subscribe().await?;
        let mut events = subscription.events();
        println!("subscribed to posts; waiting for changes");

        while let Some(event) = events.recv().await {
            match event.into_result() {
                Ok((EventAction::Delete, record)) => {
                    let id = record.get("id").and_then(|id| id.as_str()).unwrap_or_default();
                    println!("deleted id={id}");
                }
                Ok((action, record)) => {
                    println!("{action:?} {}", serde_json::Value::Object(record));
                }
                Err(err) => eprintln!("undecodable event: {err} payload={}", err.payload),
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
