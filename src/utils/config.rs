//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`.
/// Returns `Ok(config)` on success, and `Err(SyncrepError)` on parser
/// failure or unexpected field names.
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, SyncrepError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if let Some(name) = table.keys().next() {
                return Err(SyncrepError::Config(format!(
                    "invalid field name '{}' in config",
                    name,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}
