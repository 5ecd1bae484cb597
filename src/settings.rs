use crate::db::{Database, StoreError};
use serde::{Deserialize, Serialize};

/// Returned by [`resolve_provider`] when no configured provider serves the model.
pub const PROVIDER_NOT_FOUND: &str = "not_found";

/// Keys stored in the `settings` table.
pub const SETTING_KEYS: &[&str] = &[
    "providers",
    "active_provider",
    "active_model",
    "web_search",
    "tavily_api_key",
];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    pub api_key: String,
    /// Comma-separated model names served by this provider.
    #[serde(default)]
    pub models: String,
}

impl ProviderConfig {
    pub fn serves(&self, model_name: &str) -> bool {
        self.models.split(',').any(|m| m.trim() == model_name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ActiveModel {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Settings {
    pub providers: Vec<ProviderConfig>,
    pub active: Option<ActiveModel>,
    pub web_search: bool,
    pub tavily_api_key: String,
}

impl Settings {
    pub fn load(db: &Database) -> Result<Self, StoreError> {
        let providers = match db.get_setting("providers")? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        let active = match (db.get_setting("active_provider")?, db.get_setting("active_model")?) {
            (Some(provider), Some(model)) => Some(ActiveModel { provider, model }),
            _ => None,
        };
        let web_search = db
            .get_setting("web_search")?
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let tavily_api_key = db.get_setting("tavily_api_key")?.unwrap_or_default();

        Ok(Self {
            providers,
            active,
            web_search,
            tavily_api_key,
        })
    }

    pub fn save(&self, db: &Database) -> Result<(), StoreError> {
        db.set_setting("providers", &serde_json::to_string(&self.providers)?)?;
        match &self.active {
            Some(active) => {
                db.set_setting("active_provider", &active.provider)?;
                db.set_setting("active_model", &active.model)?;
            }
            None => {
                db.delete_setting("active_provider")?;
                db.delete_setting("active_model")?;
            }
        }
        db.set_setting("web_search", if self.web_search { "true" } else { "false" })?;
        db.set_setting("tavily_api_key", &self.tavily_api_key)?;
        Ok(())
    }

    /// Adds a provider, or replaces the one with the same canonical id.
    pub fn upsert_provider(&mut self, provider: ProviderConfig) {
        let id = canonical_provider_id(&provider.name);
        match self
            .providers
            .iter_mut()
            .find(|p| canonical_provider_id(&p.name) == id)
        {
            Some(existing) => *existing = provider,
            None => self.providers.push(provider),
        }
    }

    fn provider_for(&self, model_name: &str) -> Option<&ProviderConfig> {
        if let Some(active) = self.active.as_ref().filter(|a| a.model == model_name) {
            let wanted = canonical_provider_id(&active.provider);
            if let Some(provider) = self
                .providers
                .iter()
                .find(|p| canonical_provider_id(&p.name) == wanted)
            {
                return Some(provider);
            }
        }
        self.providers.iter().find(|p| p.serves(model_name))
    }
}

/// API key for the provider serving `model_name`.
///
/// Order: the active pairing when it names this model, then the first provider
/// listing the model, then the first configured provider, then empty.
pub fn resolve_api_key(settings: &Settings, model_name: &str) -> String {
    settings
        .provider_for(model_name)
        .or_else(|| settings.providers.first())
        .map(|p| p.api_key.clone())
        .unwrap_or_default()
}

/// Canonical provider id for `model_name`, or [`PROVIDER_NOT_FOUND`].
pub fn resolve_provider(settings: &Settings, model_name: &str) -> String {
    settings
        .provider_for(model_name)
        .map(|p| canonical_provider_id(&p.name))
        .unwrap_or_else(|| PROVIDER_NOT_FOUND.to_string())
}

/// Lower-cases a provider label; "Hugging Face" collapses to `huggingface`.
pub fn canonical_provider_id(label: &str) -> String {
    let id = label.trim().to_lowercase();
    match id.as_str() {
        "hugging face" => "huggingface".to_string(),
        _ => id,
    }
}

/// Masks an API key for display.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        value.to_string()
    }
}
