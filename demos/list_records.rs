use std::error::Error;

use pocketbase_sdk::records::{Collection, ParamsList};
use pocketbase_sdk::Client;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Post {
    id: String,
    #[serde(default)]
    title: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let base_url = "http://127.0.0.1:8090".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = Client::new(base_url)?;
        let posts: Collection<Post> = Collection::new(&client, "posts");

        let page = posts
            .list(ParamsList {
                per_page: Some(20),
                sort: Some("-created".to_string()),
                ..ParamsList::default()
            })
            .await?;

        println!(
            "page {} of {} ({} posts)",
            page.page, page.total_pages, page.total_items
        );
        for post in page.items {
            println!("{} {}", post.id, post.title);
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
