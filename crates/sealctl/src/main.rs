use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Once;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dataset::{
    decrypt_file, encrypt_file, init_keys, replace_keys, CryptoContext, CryptoMode, DataReader,
    KmsConfig, ReadPlan, SaveMode,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let format = std::env::var("SEAL_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

        if format.eq_ignore_ascii_case("json") {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter.clone())
                .with_target(true)
                .with_writer(io::stderr)
                .json()
                .flatten_event(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_writer(io::stderr)
                .compact()
                .init();
        }
    });
}

#[derive(Parser)]
#[command(name = "sealctl")]
#[command(about = "Envelope-encrypted dataset utility", long_about = None)]
struct Cli {
    #[command(flatten)]
    keys: KeyArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Where the KMS settings come from: a JSON file, `--conf` pairs, or the
/// `SEAL_*` environment variables, in that order of preference.
#[derive(Args, Debug, Clone, Default)]
struct KeyArgs {
    /// JSON KMS configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// KMS setting as key=value (e.g. kms_type=SimpleKeyManagementService)
    #[arg(long = "conf", value_parser = parse_key_val, global = true)]
    conf: Vec<(String, String)>,
}

impl KeyArgs {
    fn kms_config(&self) -> Result<KmsConfig> {
        if let Some(path) = &self.config {
            let json = fs::read_to_string(path)
                .with_context(|| format!("reading KMS config {}", path.display()))?;
            return KmsConfig::from_json(&json)
                .with_context(|| format!("parsing KMS config {}", path.display()));
        }
        if !self.conf.is_empty() {
            return KmsConfig::from_map(self.conf.iter().map(|(k, v)| (k, v)))
                .context("invalid --conf settings");
        }
        KmsConfig::from_env().context("no --config or --conf given and SEAL_* variables incomplete")
    }

    /// Plain contexts need no key material; anything else loads the data key.
    fn context(&self, modes: &[CryptoMode]) -> Result<CryptoContext> {
        if modes.iter().all(|mode| !mode.is_encrypted()) {
            return Ok(CryptoContext::plain());
        }
        let config = self.kms_config()?;
        CryptoContext::new(config).context("loading data key")
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {s:?}"))
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum Format {
    #[default]
    Csv,
    /// Tab separated
    Delimited,
    /// One row per line, single `value` column
    Text,
    Columnar,
}

#[derive(Args, Debug, Clone)]
struct ReadArgs {
    /// File or directory of part files
    path: PathBuf,
    #[arg(long, default_value = "plain_text")]
    mode: CryptoMode,
    #[arg(long, value_enum, default_value_t)]
    format: Format,
    /// First line of each object names the columns
    #[arg(long)]
    header: bool,
    /// Minimum number of read partitions
    #[arg(long)]
    partitions: Option<usize>,
}

impl ReadArgs {
    fn plan(&self, ctx: &CryptoContext) -> ReadPlan {
        let mut reader: DataReader = ctx.read(self.mode).option("header", self.header);
        if let Some(n) = self.partitions {
            reader = reader.partitions(n);
        }
        match self.format {
            Format::Csv => reader.csv(&self.path),
            Format::Delimited => reader.delimited(&self.path),
            Format::Text => reader.text(&self.path),
            Format::Columnar => reader.columnar(&self.path),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the primary key and data key files
    InitKeys {
        /// Replace existing key files; data sealed under the old key is lost
        #[arg(long)]
        force: bool,
    },
    /// Encrypt one file
    Encrypt {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, default_value = "AES_GCM_CTR_V1")]
        mode: CryptoMode,
    },
    /// Decrypt one file
    Decrypt {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, default_value = "AES_GCM_CTR_V1")]
        mode: CryptoMode,
    },
    /// Print the lines of a file or directory to stdout
    Cat {
        path: PathBuf,
        #[arg(long, default_value = "plain_text")]
        mode: CryptoMode,
    },
    /// Count the rows of a dataset
    Count(ReadArgs),
    /// Show the read tasks planned for a dataset as JSON
    Plan(ReadArgs),
    /// Rewrite a dataset under another mode or format
    Convert {
        #[command(flatten)]
        input: ReadArgs,
        /// Output directory
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "AES_GCM_CTR_V1")]
        to_mode: CryptoMode,
        #[arg(long, value_enum, default_value_t)]
        to_format: Format,
        #[arg(long, default_value = "errorifexists")]
        save_mode: SaveMode,
        /// lz4 or zstd, with an optional :level
        #[arg(long)]
        compression: Option<String>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let keys = cli.keys;
    match cli.command {
        Commands::InitKeys { force } => {
            let config = keys.kms_config()?;
            if force {
                replace_keys(&config)?;
            } else {
                init_keys(&config).context("use --force to replace the existing keys")?;
            }
            println!("Primary key: {}", config.primary_key_path().display());
            println!("Data key:    {}", config.data_key_path().display());
        }
        Commands::Encrypt {
            input,
            output,
            mode,
        } => {
            let ctx = keys.context(&[mode])?;
            let summary = encrypt_file(&ctx, &input, &output, mode)?;
            println!(
                "Encrypted {} -> {} ({} -> {} bytes, {} records)",
                input.display(),
                output.display(),
                summary.plaintext_bytes,
                summary.ciphertext_bytes,
                summary.records
            );
        }
        Commands::Decrypt {
            input,
            output,
            mode,
        } => {
            let ctx = keys.context(&[mode])?;
            let written = decrypt_file(&ctx, &input, &output, mode)?;
            println!(
                "Decrypted {} -> {} ({written} bytes)",
                input.display(),
                output.display()
            );
        }
        Commands::Cat { path, mode } => {
            let ctx = keys.context(&[mode])?;
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            for line in ctx.read_lines(&path, mode)?.lines()? {
                writeln!(out, "{}", line?)?;
            }
            out.flush()?;
        }
        Commands::Count(args) => {
            let ctx = keys.context(&[args.mode])?;
            let dataset = args.plan(&ctx).collect()?;
            println!("{}", dataset.count());
        }
        Commands::Plan(args) => {
            let ctx = keys.context(&[args.mode])?;
            let tasks = args.plan(&ctx).tasks()?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        Commands::Convert {
            input,
            output,
            to_mode,
            to_format,
            save_mode,
            compression,
        } => {
            let ctx = keys.context(&[input.mode, to_mode])?;
            let dataset = input.plan(&ctx).collect()?;

            let mut writer = ctx
                .write(&dataset, to_mode)
                .mode(save_mode)
                .option("header", input.header);
            if let Some(codec) = compression {
                if matches!(to_format, Format::Columnar) {
                    bail!("columnar output cannot be compressed");
                }
                writer = writer.option("compression", codec);
            }
            let plan = match to_format {
                Format::Csv => writer.csv(&output),
                Format::Delimited => writer.delimited(&output),
                Format::Text => writer.text(&output),
                Format::Columnar => writer.columnar(&output),
            };
            let summary = plan.execute()?;
            if summary.skipped {
                println!("{} exists, nothing written", output.display());
            } else {
                tracing::info!(
                    parts = summary.parts.len(),
                    rows = summary.rows(),
                    "dataset converted"
                );
                println!(
                    "Wrote {} rows in {} parts to {}",
                    summary.rows(),
                    summary.parts.len(),
                    output.display()
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sealctl").chain(args.iter().copied())).unwrap()
    }

    fn conf_pairs(dir: &std::path::Path) -> Vec<(String, String)> {
        [
            ("kms_type", "SimpleKeyManagementService".to_string()),
            ("simple_app_id", "465227134889".to_string()),
            ("simple_app_key", "799072978028".to_string()),
            ("primary_key_path", dir.join("primaryKey").display().to_string()),
            ("data_key_path", dir.join("dataKey").display().to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    fn run_args(dir: &std::path::Path, args: &[&str]) -> Result<()> {
        let mut all: Vec<String> = conf_pairs(dir)
            .into_iter()
            .flat_map(|(k, v)| ["--conf".to_string(), format!("{k}={v}")])
            .collect();
        all.extend(args.iter().map(|a| a.to_string()));
        let all: Vec<&str> = all.iter().map(String::as_str).collect();
        run(cli(&all))
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("kms_type = local").unwrap(),
            ("kms_type".to_string(), "local".to_string())
        );
        assert!(parse_key_val("no-equals").is_err());
        assert!(parse_key_val("=value").is_err());
    }

    #[test]
    fn test_mode_arguments() {
        let parsed = cli(&["encrypt", "a", "b", "--mode", "AES/CBC/PKCS5Padding"]);
        assert!(matches!(
            parsed.command,
            Commands::Encrypt {
                mode: CryptoMode::AesCbcPkcs5Padding,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["sealctl", "cat", "x", "--mode", "rot13"]).is_err());
    }

    #[test]
    fn test_plain_commands_need_no_keys() {
        let ctx = KeyArgs::default().context(&[CryptoMode::PlainText]).unwrap();
        assert!(!ctx.has_data_key());
    }

    #[test]
    fn test_init_keys_needs_force_to_replace() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        run_args(root, &["init-keys"]).unwrap();
        let data_key = fs::read(root.join("dataKey")).unwrap();

        let err = run_args(root, &["init-keys"]).unwrap_err();
        assert!(format!("{err:#}").contains("--force"), "{err:#}");
        assert_eq!(fs::read(root.join("dataKey")).unwrap(), data_key);

        run_args(root, &["init-keys", "--force"]).unwrap();
        assert_ne!(fs::read(root.join("dataKey")).unwrap(), data_key);
    }

    #[test]
    fn test_init_encrypt_convert_count() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("people.csv"), "name,age\njack,18\nalex,20\n").unwrap();
        let input = root.join("people.csv").display().to_string();
        let sealed = root.join("people.csv.cbc").display().to_string();
        let out = root.join("out").display().to_string();

        run_args(root, &["init-keys"]).unwrap();
        run_args(root, &["encrypt", &input, &sealed, "--mode", "cbc"]).unwrap();
        run_args(
            root,
            &[
                "convert", &sealed, "--mode", "cbc", "--header", "--output", &out, "--to-mode",
                "gcm",
            ],
        )
        .unwrap();

        let keys = KeyArgs {
            config: None,
            conf: conf_pairs(root),
        };
        let ctx = keys.context(&[CryptoMode::AesGcmCtrV1]).unwrap();
        let back = ctx
            .read(CryptoMode::AesGcmCtrV1)
            .option("header", true)
            .csv(&out)
            .collect()
            .unwrap();
        assert_eq!(back.count(), 2);
        assert_eq!(back.columns(), ["name", "age"]);
    }
}
