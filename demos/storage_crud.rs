use std::error::Error;

use hostdb_sdk::session::SessionState;
use hostdb_sdk::storage::StorageClient;
use secrecy::SecretString;
use serde_json::json;

fn main() -> Result<(), Box<dyn Error>> {
    let base_url = "http://localhost:8080/api/demoDb";
    let api_key = "REPLACE_WITH_API_KEY".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let session = SessionState::new();
        let client = StorageClient::new(base_url, SecretString::new(api_key), session)?;

        let key = "demo-key-7";
        client
            .set(key, json!({"name": "Mike G.", "status": "OK"}))
            .await?;
        client
            .add(key, json!({"name": "Stephan R.", "status": "Good"}))
            .await?;

        let record = client.get(key).await?;
        println!("record: {record:?}");

        let count = client.count(key).await?;
        println!("count: {count:?}");

        client.update(key, 0, json!({"name": "Mike G.", "status": "So-so"})).await?;
        client.delete(key, None).await?;

        let gone = client.get(key).await?;
        println!("after delete: {gone:?}");

        Ok(())
    })
}
