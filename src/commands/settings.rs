use crate::db::Database;
use crate::llm::backend::BackendClient;
use crate::settings::{canonical_provider_id, mask_secret, ProviderConfig, Settings, SETTING_KEYS};
use std::collections::BTreeMap;

pub fn get_settings(db: &Database) -> Result<BTreeMap<String, String>, String> {
    let mut map = BTreeMap::new();
    for key in SETTING_KEYS {
        if let Some(value) = db.get_setting(key).map_err(|e| e.to_string())? {
            // Mask API keys for display
            if key.ends_with("_api_key") {
                map.insert(key.to_string(), mask_secret(&value));
            } else {
                map.insert(key.to_string(), value);
            }
        }
    }
    Ok(map)
}

pub fn show_settings(db: &Database) -> Result<(), String> {
    for (key, value) in get_settings(db)? {
        if key == "providers" {
            continue;
        }
        println!("{} = {}", key, value);
    }
    let settings = Settings::load(db).map_err(|e| e.to_string())?;
    for provider in &settings.providers {
        println!(
            "provider {} ({}) key={} models=[{}]",
            provider.name,
            canonical_provider_id(&provider.name),
            mask_secret(&provider.api_key),
            provider.models
        );
    }
    Ok(())
}

pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<(), String> {
    if !SETTING_KEYS.contains(&key) {
        return Err(format!("Unknown setting key: {}", key));
    }
    match key {
        "providers" => {
            serde_json::from_str::<Vec<ProviderConfig>>(value)
                .map_err(|e| format!("Invalid providers list: {}", e))?;
        }
        "web_search" if !matches!(value, "true" | "false") => {
            return Err(format!("web_search must be true or false, got: {}", value));
        }
        _ => {}
    }
    db.set_setting(key, value).map_err(|e| e.to_string())
}

pub fn add_provider(db: &Database, name: &str, api_key: &str, models: &str) -> Result<(), String> {
    let mut settings = Settings::load(db).map_err(|e| e.to_string())?;
    settings.upsert_provider(ProviderConfig {
        name: name.to_string(),
        api_key: api_key.to_string(),
        models: models.to_string(),
    });
    settings.save(db).map_err(|e| e.to_string())
}

pub fn use_model(db: &Database, provider: &str, model: &str) -> Result<(), String> {
    let settings = Settings::load(db).map_err(|e| e.to_string())?;
    let wanted = canonical_provider_id(provider);
    if !settings
        .providers
        .iter()
        .any(|p| canonical_provider_id(&p.name) == wanted)
    {
        return Err(format!("Provider not configured: {}", provider));
    }
    db.set_setting("active_provider", provider)
        .map_err(|e| e.to_string())?;
    db.set_setting("active_model", model)
        .map_err(|e| e.to_string())
}

pub async fn list_models(client: &BackendClient, provider: &str, api_key: &str) -> Result<(), String> {
    let models = client
        .fetch_models(&canonical_provider_id(provider), api_key)
        .await
        .map_err(|e| e.to_string())?;
    for model in models {
        println!("{}", model);
    }
    Ok(())
}
