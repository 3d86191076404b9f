use clap::{Args, Parser, Subcommand, ValueEnum};
use std::error::Error;
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{read_config, write_config, AppConfig};
use crate::credential::{Credential, Environment, NewCredential, Platform};
use crate::credential_store::{CredentialRecord, CredentialStore};
use crate::host::cdp::{find_chrome_binary, CdpHost};
use crate::login::LoginCoordinator;
use crate::secret::PasswordVault;

#[derive(Parser)]
#[command(
    name = "oneclick",
    version = crate::version::APP_VERSION,
    about = "Saved logins with one-click browser sign-in"
)]
pub struct Cli {
    /// Config file (default: <config dir>/oneclick/config.json).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Data directory holding credentials.json and the browser profile.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Credential(CredentialArgs),
    /// Open the credential's login page and sign in.
    Login(LoginArgs),
    Config(ConfigArgs),
}

#[derive(Args)]
struct CredentialArgs {
    #[command(subcommand)]
    command: CredentialCommand,
}

#[derive(Subcommand)]
enum CredentialCommand {
    Add(CredentialAddArgs),
    List,
    /// Copy a stored username or password to the clipboard.
    Copy(CredentialCopyArgs),
    Remove(CredentialRemoveArgs),
}

#[derive(Args)]
struct CredentialAddArgs {
    #[arg(long, default_value = "salesforce")]
    platform: String,
    /// Login page URL. Defaults to the platform's environment preset.
    #[arg(long)]
    url: Option<String>,
    #[arg(long, value_enum)]
    environment: Option<Environment>,
    #[arg(long)]
    username: String,
    /// Read from stdin when omitted.
    #[arg(long)]
    password: Option<String>,
}

#[derive(Args)]
struct CredentialCopyArgs {
    #[arg(long)]
    id: String,
    #[arg(long, value_enum)]
    field: CopyField,
    /// Print the value instead of using the clipboard.
    #[arg(long, default_value_t = false)]
    stdout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CopyField {
    Username,
    Password,
}

#[derive(Args)]
struct CredentialRemoveArgs {
    #[arg(long)]
    id: String,
    /// Skip the confirmation prompt.
    #[arg(long, short = 'y', default_value_t = false)]
    yes: bool,
}

#[derive(Args)]
struct LoginArgs {
    #[arg(long)]
    id: String,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration.
    Show,
    /// Write the default configuration file.
    Init(ConfigInitArgs),
    /// Print the config file location.
    Path,
}

#[derive(Args)]
struct ConfigInitArgs {
    #[arg(long, default_value_t = false)]
    force: bool,
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    crate::init_logging();
    match cli.command {
        Commands::Credential(ref args) => run_credential(args, &cli),
        Commands::Login(ref args) => run_login(args, &cli),
        Commands::Config(ref args) => run_config(args, &cli),
    }
}

fn boxed(err: Box<dyn Error + Send + Sync>) -> Box<dyn Error> {
    err
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf, Box<dyn Error>> {
    match &cli.config {
        Some(path) => Ok(path.clone()),
        None => crate::config::default_config_path()
            .ok_or_else(|| "could not determine the config directory; pass --config".into()),
    }
}

fn resolve_data_dir(cli: &Cli) -> Result<PathBuf, Box<dyn Error>> {
    match &cli.data_dir {
        Some(path) => Ok(path.clone()),
        None => crate::config::default_data_dir()
            .ok_or_else(|| "could not determine the data directory; pass --data-dir".into()),
    }
}

fn run_credential(args: &CredentialArgs, cli: &Cli) -> Result<(), Box<dyn Error>> {
    let store = CredentialStore::open(&resolve_data_dir(cli)?);
    match &args.command {
        CredentialCommand::Add(add_args) => {
            let password = match &add_args.password {
                Some(password) => password.clone(),
                None => read_password_stdin()?,
            };
            let credential = add_credential(&store, add_args, password)?;
            println!("{}", credential.id);
            eprintln!("Credential stored.");
            Ok(())
        }
        CredentialCommand::List => {
            let records = store.list().map_err(boxed)?;
            if records.is_empty() {
                println!("No credentials stored.");
            }
            for record in records {
                println!(
                    "{}\t{}\t{}\t{}",
                    record.id,
                    record.platform.display_name(),
                    record.url,
                    record.username
                );
            }
            Ok(())
        }
        CredentialCommand::Copy(copy_args) => {
            let id = require_cli_field("id", &copy_args.id)?;
            let value = copied_value(&store, &id, copy_args.field)?;
            if copy_args.stdout {
                println!("{value}");
                return Ok(());
            }
            match copy_to_clipboard(&value) {
                Ok(()) => eprintln!("Copied {} to the clipboard.", copy_args.field.label()),
                Err(err) => {
                    log::warn!("clipboard unavailable, printing instead: {err}");
                    println!("{value}");
                }
            }
            Ok(())
        }
        CredentialCommand::Remove(remove_args) => {
            let removed = remove_credential(
                &store,
                remove_args,
                &mut io::stdin().lock(),
                &mut io::stderr(),
            )?;
            if removed {
                eprintln!("Credential removed.");
            } else {
                eprintln!("Cancelled.");
            }
            Ok(())
        }
    }
}

impl CopyField {
    fn label(self) -> &'static str {
        match self {
            CopyField::Username => "username",
            CopyField::Password => "password",
        }
    }
}

fn copied_value<V: PasswordVault>(
    store: &CredentialStore<V>,
    id: &str,
    field: CopyField,
) -> Result<String, Box<dyn Error>> {
    let value = match field {
        // The username is in the record; only the password needs the keychain.
        CopyField::Username => store
            .list()
            .map_err(boxed)?
            .into_iter()
            .find(|record| record.id == id)
            .map(|record| record.username),
        CopyField::Password => store.get(id).map_err(boxed)?.map(|c| c.password),
    };
    value.ok_or_else(|| format!("no credential with id '{id}'").into())
}

fn copy_to_clipboard(text: &str) -> Result<(), arboard::Error> {
    let mut clipboard = arboard::Clipboard::new()?;
    clipboard.set_text(text)
}

/// Delete a credential after confirming on `prompt`, unless `--yes` was given.
/// Returns whether it was deleted.
fn remove_credential<V: PasswordVault>(
    store: &CredentialStore<V>,
    args: &CredentialRemoveArgs,
    input: &mut impl BufRead,
    prompt: &mut impl Write,
) -> Result<bool, Box<dyn Error>> {
    let id = require_cli_field("id", &args.id)?;
    let record = store
        .list()
        .map_err(boxed)?
        .into_iter()
        .find(|record| record.id == id)
        .ok_or_else(|| format!("no credential with id '{id}'"))?;
    if !args.yes && !confirm_removal(&record, input, prompt)? {
        return Ok(false);
    }
    if !store.delete(&id).map_err(boxed)? {
        return Err(format!("no credential with id '{id}'").into());
    }
    Ok(true)
}

fn confirm_removal(
    record: &CredentialRecord,
    input: &mut impl BufRead,
    prompt: &mut impl Write,
) -> io::Result<bool> {
    write!(
        prompt,
        "Delete the {} credential for {} ({})? [y/N] ",
        record.platform.display_name(),
        record.username,
        record.url
    )?;
    prompt.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn add_credential<V: PasswordVault>(
    store: &CredentialStore<V>,
    args: &CredentialAddArgs,
    password: String,
) -> Result<Credential, Box<dyn Error>> {
    let platform = Platform::from(args.platform.clone());
    let url = match &args.url {
        Some(url) => url.clone(),
        None => platform
            .environment_url(args.environment.unwrap_or(Environment::Production))
            .map(str::to_string)
            .ok_or_else(|| format!("--url is required for {} credentials", platform.display_name()))?,
    };
    let credential = Credential::create(NewCredential {
        platform,
        url,
        username: args.username.clone(),
        password,
    })?;
    store.add(&credential).map_err(boxed)?;
    Ok(credential)
}

fn read_password_stdin() -> Result<String, Box<dyn Error>> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf)?;
    Ok(buf.trim_end_matches(['\r', '\n']).to_string())
}

fn run_login(args: &LoginArgs, cli: &Cli) -> Result<(), Box<dyn Error>> {
    let id = require_cli_field("id", &args.id)?;
    let data_dir = resolve_data_dir(cli)?;
    let config = read_config(&resolve_config_path(cli)?);

    let store = CredentialStore::open(&data_dir);
    let credential = store
        .get(&id)
        .map_err(boxed)?
        .ok_or_else(|| format!("no credential with id '{id}'"))?;
    ensure_autofill_supported(&credential)?;

    let chrome_path = match &config.browser.chrome_path {
        Some(path) => path.clone(),
        None => find_chrome_binary().map_err(boxed)?,
    };
    let profile_dir = config.profile_dir(&data_dir);

    eprintln!(
        "Signing in to {} as {}",
        credential.url_display(),
        credential.username
    );
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_login_async(config, credential, chrome_path, profile_dir))
        .map_err(boxed)?;
    Ok(())
}

async fn run_login_async(
    config: AppConfig,
    credential: Credential,
    chrome_path: PathBuf,
    profile_dir: PathBuf,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let headless = config.browser.headless;
    let host = Arc::new(CdpHost::launch(&chrome_path, &profile_dir, headless).await?);
    let coordinator = LoginCoordinator::new(
        Arc::clone(&host),
        Arc::new(config.staging_slot()),
        config.executor(),
        config.load_timeout(),
    );

    let ack = coordinator.perform_login(&credential);
    println!("{}", serde_json::to_string(&ack)?);
    coordinator.drain().await;

    if headless {
        host.close().await;
    } else {
        eprintln!("Close the browser window to exit.");
        host.wait_closed().await;
    }
    Ok(())
}

fn ensure_autofill_supported(credential: &Credential) -> Result<(), Box<dyn Error>> {
    if credential.platform.supports_autofill() {
        return Ok(());
    }
    Err(format!(
        "one-click login is not available for {} credentials yet",
        credential.platform.display_name()
    )
    .into())
}

fn run_config(args: &ConfigArgs, cli: &Cli) -> Result<(), Box<dyn Error>> {
    let path = resolve_config_path(cli)?;
    match &args.command {
        ConfigCommand::Show => {
            let config = read_config(&path);
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigCommand::Init(init_args) => init_config(&path, init_args.force),
        ConfigCommand::Path => {
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn init_config(path: &Path, force: bool) -> Result<(), Box<dyn Error>> {
    if path.exists() && !force {
        return Err(format!(
            "'{}' already exists; pass --force to overwrite",
            path.display()
        )
        .into());
    }
    write_config(path, &AppConfig::default()).map_err(boxed)?;
    eprintln!("Wrote {}", path.display());
    Ok(())
}

fn require_cli_field(field_name: &str, value: &str) -> Result<String, Box<dyn Error>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{field_name} is required"),
        )
        .into());
    }
    Ok(trimmed.to_string())
}
