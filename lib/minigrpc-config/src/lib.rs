//! Primitives for loading typed configuration data.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, path::Path};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider,
};
use minigrpc_error::GenericError;
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

mod provider;
use self::provider::ResolvedProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        ///
        /// Includes the environment variable form of the field if environment variables were loaded.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field's data type was not the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Name of the invalid field.
        ///
        /// This is a period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to load configuration: {}", source))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        from_figment_error(&HashSet::new(), e)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum LookupSource {
    /// The configuration key is looked up in a form suitable for environment variables.
    Environment { prefix: String },
}

impl LookupSource {
    fn transform_key(&self, key: &str) -> String {
        match self {
            // The prefix is already uppercased with a trailing underscore.
            LookupSource::Environment { prefix } => format!("{}{}", prefix, key.replace('.', "_").to_uppercase()),
        }
    }
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that can pull from various sources.
///
/// This loader provides a wrapper around a lower-level library, `figment`, to expose a simpler and focused API for
/// loading configuration data from various sources and extracting it as a typed value.
///
/// Sources have an implicit priority based on the order in which they are added: sources added later take precedence
/// over sources added earlier.
///
/// # Supported sources
///
/// - YAML file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    lookup_sources: HashSet<LookupSource>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let resolved_provider = ResolvedProvider::from_yaml(&path)
            .map_err(GenericError::from)
            .context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(resolved_provider)));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring any errors.
    ///
    /// Errors include the file not existing, not being readable/accessible, and not being valid YAML.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        match ResolvedProvider::from_yaml(&path) {
            Ok(resolved_provider) => {
                self.providers.push(BoxedProvider(Box::new(resolved_provider)));
            }
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read YAML configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix given will have an underscore appended to it if it does not already end with one. For example, with a
    /// prefix of `app`, any environment variable starting with `app_` would be matched.
    ///
    /// The prefix is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the matching environment variables cannot be read, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` isn't `Send + Sync`, so take a snapshot of the matching variables instead.
        let env = Env::prefixed(&prefix);
        let values = env.data()?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(default_dict.clone()))));
            self.lookup_sources.insert(LookupSource::Environment { prefix });
        }
        Ok(self)
    }

    /// Consumes the configuration loader, deserializing it as `T`.
    ///
    /// Fields missing from every source fall back to whatever defaults `T` declares through `serde`.
    ///
    /// ## Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = self
            .providers
            .into_iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider));

        figment
            .extract()
            .map_err(|e| from_figment_error(&self.lookup_sources, e))
    }
}

fn from_figment_error(lookup_sources: &HashSet<LookupSource>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut valid_keys = lookup_sources
                .iter()
                .map(|source| source.transform_key(&field))
                .collect::<Vec<_>>();

            // Always specify the original key as a valid key to try.
            valid_keys.insert(0, field.to_string());

            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Settings {
        listen_address: String,

        #[serde(default = "default_grace")]
        grace_secs: u64,
    }

    fn default_grace() -> u64 {
        10
    }

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn yaml_values_are_extracted() {
        let file = yaml_file("listen_address: tcp://127.0.0.1:9003\ngrace_secs: 3\n");

        let settings: Settings = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_typed()
            .unwrap();

        assert_eq!(settings.listen_address, "tcp://127.0.0.1:9003");
        assert_eq!(settings.grace_secs, 3);
    }

    #[test]
    fn serde_defaults_fill_gaps() {
        let file = yaml_file("listen_address: tcp://127.0.0.1:9003\n");

        let settings: Settings = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_typed()
            .unwrap();

        assert_eq!(settings.grace_secs, 10);
    }

    #[test]
    fn missing_yaml_file_is_an_error_unless_optional() {
        assert!(ConfigurationLoader::default()
            .from_yaml("/nonexistent/minigrpc.yaml")
            .is_err());

        let loader = ConfigurationLoader::default().try_from_yaml("/nonexistent/minigrpc.yaml");
        assert!(loader.providers.is_empty());
    }

    #[test]
    fn environment_overrides_yaml() {
        let file = yaml_file("listen_address: tcp://127.0.0.1:9003\ngrace_secs: 3\n");
        std::env::set_var("MINIGRPC_CFGTEST_OVERRIDE_GRACE_SECS", "7");

        let settings: Settings = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .from_environment("minigrpc_cfgtest_override")
            .unwrap()
            .into_typed()
            .unwrap();

        assert_eq!(settings.listen_address, "tcp://127.0.0.1:9003");
        assert_eq!(settings.grace_secs, 7);
    }

    #[test]
    fn missing_field_mentions_environment_variable() {
        std::env::set_var("MINIGRPC_CFGTEST_MISSING_GRACE_SECS", "1");

        let result = ConfigurationLoader::default()
            .from_environment("MINIGRPC_CFGTEST_MISSING")
            .unwrap()
            .into_typed::<Settings>();

        match result {
            Err(ConfigurationError::MissingField { field, help_text }) => {
                assert_eq!(field, "listen_address");
                assert!(help_text.contains("MINIGRPC_CFGTEST_MISSING_LISTEN_ADDRESS"));
            }
            other => panic!("expected missing field error, got {:?}", other),
        }
    }

    #[test]
    fn invalid_field_type_is_reported() {
        let file = yaml_file("listen_address: tcp://127.0.0.1:9003\ngrace_secs: soon\n");

        let result = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_typed::<Settings>();

        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidFieldType { ref field, .. }) if field == "grace_secs"
        ));
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(matches!(
            ConfigurationLoader::default().from_environment(""),
            Err(ConfigurationError::EmptyPrefix)
        ));
    }
}
