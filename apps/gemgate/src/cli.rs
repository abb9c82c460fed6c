use clap::Parser;

use gemgate_common::GlobalConfigPatch;

#[derive(Parser)]
#[command(name = "gemgate", about = "Authenticating reverse proxy for the Gemini Code Assist API")]
pub(crate) struct Cli {
    #[arg(long, env = "GEMGATE_HOST", default_value = "0.0.0.0")]
    pub(crate) host: String,
    #[arg(long, env = "GEMGATE_PORT", default_value_t = 8888)]
    pub(crate) port: u16,
    /// Directory holding the credential database.
    #[arg(long, env = "GEMGATE_DATA_DIR", default_value = "")]
    pub(crate) data_dir: String,
    /// Outbound proxy for upstream egress.
    #[arg(long, env = "GEMGATE_PROXY")]
    pub(crate) proxy: Option<String>,
}

impl Cli {
    pub(crate) fn into_patch(self) -> GlobalConfigPatch {
        let data_dir = resolve_data_dir(&self.data_dir);
        GlobalConfigPatch {
            host: Some(self.host),
            port: Some(self.port),
            db_path: Some(format!("{}/auth.db", data_dir.trim_end_matches('/'))),
            proxy: self.proxy,
        }
    }
}

fn resolve_data_dir(cli_value: &str) -> String {
    if !cli_value.trim().is_empty() {
        return cli_value.to_string();
    }
    "./data".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_defaults_and_db_path_derivation() {
        assert_eq!(resolve_data_dir(""), "./data");
        assert_eq!(resolve_data_dir("/var/lib/gemgate"), "/var/lib/gemgate");

        let cli = Cli {
            host: "127.0.0.1".to_string(),
            port: 9999,
            data_dir: "/tmp/g/".to_string(),
            proxy: None,
        };
        let patch = cli.into_patch();
        assert_eq!(patch.db_path.as_deref(), Some("/tmp/g/auth.db"));
    }
}
