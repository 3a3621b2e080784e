use crate::quiz::firestore::DEFAULT_FIRESTORE_URL;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub firebase_project_id: String,
    pub firebase_api_key: Option<String>,
    pub firestore_base_url: String,
    pub special_test_service_url: String,
    pub dialogue_db_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        Ok(Self {
            firebase_project_id: required("FIREBASE_PROJECT_ID")?,
            firebase_api_key: var("FIREBASE_API_KEY"),
            firestore_base_url: var("FIRESTORE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_FIRESTORE_URL.to_string()),
            special_test_service_url: required("SPECIAL_TEST_SERVICE_URL")?,
            dialogue_db_path: var("DIALOGUE_DB_PATH").unwrap_or_else(|| "db.sqlite".to_string()),
        })
    }
}
