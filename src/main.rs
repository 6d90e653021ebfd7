use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use cuffvault::{
    Collection, FileSlotStore, KdfParams, LoadPolicy, Medication, Reading, Record, Session, Vault,
    VaultOptions, default_store, parse_backup, serialize_backup,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod auth;

#[derive(Debug, clap::Args)]
struct Argon2Args {
    /// Argon2 memory cost in KiB (default: 65536)
    #[arg(long = "argon-mem")]
    mem_cost_kib: Option<u32>,

    /// Argon2 time cost / iterations (default: 3)
    #[arg(long = "argon-time")]
    time_cost: Option<u32>,

    /// Argon2 parallelism (default: 1)
    #[arg(long = "argon-parallelism")]
    parallelism: Option<u32>,
}

impl Argon2Args {
    fn to_kdf_params(&self) -> Result<KdfParams> {
        let default = KdfParams::default();

        Ok(KdfParams::new(
            self.mem_cost_kib.unwrap_or(default.mem_cost_kib()),
            self.time_cost.unwrap_or(default.time_cost()),
            self.parallelism.unwrap_or(default.parallelism()),
        )?)
    }
}

#[derive(Debug, Parser)]
#[command(name = "cuffvault")]
#[command(version, about = "Encrypted, offline log of blood pressure readings and medications.")]
struct Cli {
    /// Directory holding the vault
    #[arg(long, global = true, value_name = "DIR", env = "CUFFVAULT_DIR")]
    dir: Option<PathBuf>,

    /// Treat an unreadable collection as empty instead of failing
    #[arg(long, global = true, default_value_t = false)]
    lenient: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sets the password of a new vault
    Init {
        #[command(flatten)]
        argon2: Argon2Args,
    },

    /// Shows where the vault lives and whether it is set up
    Status,

    /// Records a blood pressure reading
    #[command(arg_required_else_help = true)]
    AddReading {
        systolic: u16,
        diastolic: u16,
        pulse: u16,
        #[arg(long)]
        notes: Option<String>,
        /// Time of the reading, RFC 3339 (default: now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Lists readings, newest first
    Readings,

    /// Removes a reading by id
    #[command(arg_required_else_help = true)]
    RemoveReading { id: String },

    /// Adds a medication
    #[command(arg_required_else_help = true)]
    AddMedication {
        name: String,
        dosage: String,
        frequency: String,
        /// e.g. "morning"
        #[arg(long)]
        time: Option<String>,
    },

    /// Changes fields of a medication
    #[command(arg_required_else_help = true)]
    EditMedication {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        dosage: Option<String>,
        #[arg(long)]
        frequency: Option<String>,
        /// e.g. "evening"; an empty value clears it
        #[arg(long)]
        time: Option<String>,
    },

    /// Lists medications
    Medications,

    /// Removes a medication by id
    #[command(arg_required_else_help = true)]
    RemoveMedication { id: String },

    /// Changes the password and re-encrypts everything
    Passwd,

    /// Writes a backup of one collection
    Export {
        /// Encrypt under the current password; refused after a password change
        #[arg(long)]
        encrypted: bool,
        /// Export medications instead of readings
        #[arg(long)]
        medications: bool,
        /// Output file (default: stdout)
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },

    /// Merges a backup file into the vault
    #[command(arg_required_else_help = true)]
    Import {
        path: PathBuf,
        /// Import medications instead of readings
        #[arg(long)]
        medications: bool,
    },
}

fn resolve_store(dir: Option<PathBuf>) -> Result<FileSlotStore> {
    match dir {
        Some(d) => Ok(FileSlotStore::new(d)),
        None => Ok(default_store()?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let store = resolve_store(args.dir)?;
    let mut options = VaultOptions::default();
    if args.lenient {
        options.load_policy = LoadPolicy::Lenient;
    }

    match args.command {
        Commands::Init { argon2 } => {
            options.kdf = argon2.to_kdf_params()?;
            let vault = Vault::new(store, options);
            let password = auth::read_password()?;
            vault.setup(password).await?;
            println!("vault initialized");
        }
        Commands::Status => {
            let dir = store.dir().display().to_string();
            let vault = Vault::new(store, options);
            let state = if vault.is_set_up().await? {
                "initialized"
            } else {
                "not initialized"
            };
            println!("vault: {dir}\nstatus: {state}");
        }
        Commands::AddReading {
            systolic,
            diastolic,
            pulse,
            notes,
            at,
        } => {
            let session = open(store, options).await?;
            let mut reading = Reading::new(systolic, diastolic, pulse, at.unwrap_or_else(Utc::now))?;
            reading.notes = notes.unwrap_or_default();
            let id = reading.id.clone();
            session
                .update(move |readings: &mut Collection<Reading>| readings.insert(reading))
                .await?;
            println!("added reading {id}");
        }
        Commands::Readings => {
            let session = open(store, options).await?;
            print_readings(&session.load::<Reading>().await?);
        }
        Commands::RemoveReading { id } => {
            let session = open(store, options).await?;
            remove::<Reading>(&session, &id).await?;
            println!("removed reading {id}");
        }
        Commands::AddMedication {
            name,
            dosage,
            frequency,
            time,
        } => {
            let session = open(store, options).await?;
            let mut medication = Medication::new(&name, &dosage, &frequency)?;
            medication.time_of_day = time;
            let id = medication.id.clone();
            session
                .update(move |meds: &mut Collection<Medication>| meds.insert(medication))
                .await?;
            println!("added medication {id}");
        }
        Commands::EditMedication {
            id,
            name,
            dosage,
            frequency,
            time,
        } => {
            let session = open(store, options).await?;
            let edited = session
                .update(|meds: &mut Collection<Medication>| {
                    let mut medication = meds.get(&id)?.clone();
                    if let Some(name) = name {
                        medication.name = name;
                    }
                    if let Some(dosage) = dosage {
                        medication.dosage = dosage;
                    }
                    if let Some(frequency) = frequency {
                        medication.frequency = frequency;
                    }
                    if let Some(time) = time {
                        medication.time_of_day = Some(time).filter(|t| !t.is_empty());
                    }
                    meds.upsert(medication);
                    Some(())
                })
                .await?;
            if edited.is_none() {
                bail!("no medications entry with id '{id}'");
            }
            println!("updated medication {id}");
        }
        Commands::Medications => {
            let session = open(store, options).await?;
            print_medications(&session.load::<Medication>().await?);
        }
        Commands::RemoveMedication { id } => {
            let session = open(store, options).await?;
            remove::<Medication>(&session, &id).await?;
            println!("removed medication {id}");
        }
        Commands::Passwd => {
            let vault = Vault::new(store, options);
            let old = auth::read_password()?;
            let new = auth::read_new_password()?;
            let session = vault.unlock(old.clone()).await?;
            session.change_password(old, new).await?;
            println!("password changed");
        }
        Commands::Export {
            encrypted,
            medications,
            out,
        } => {
            let session = open(store, options).await?;
            let text = if medications {
                export::<Medication>(&session, encrypted).await?
            } else {
                export::<Reading>(&session, encrypted).await?
            };
            match out {
                Some(path) => {
                    std::fs::write(&path, text)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("backup written to {}", path.display());
                }
                None => println!("{text}"),
            }
        }
        Commands::Import { path, medications } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let backup = parse_backup(&text)?;
            let session = open(store, options).await?;
            let (added, what) = if medications {
                (session.import_and_merge::<Medication>(&backup).await?, "medications")
            } else {
                (session.import_and_merge::<Reading>(&backup).await?, "readings")
            };
            println!("imported {added} new {what}");
        }
    }

    Ok(())
}

async fn open(store: FileSlotStore, options: VaultOptions) -> Result<Session<FileSlotStore>> {
    let vault = Vault::new(store, options);
    if !vault.is_set_up().await? {
        bail!("vault is not initialized; run `cuffvault init` first");
    }
    let password = auth::read_password()?;
    Ok(vault.unlock(password).await?)
}

async fn remove<T: Record>(session: &Session<FileSlotStore>, id: &str) -> Result<()> {
    let removed = session
        .update(|records: &mut Collection<T>| records.remove(id))
        .await?;
    if removed.is_none() {
        bail!("no {} entry with id '{id}'", T::COLLECTION);
    }
    Ok(())
}

async fn export<T: Record>(session: &Session<FileSlotStore>, encrypted: bool) -> Result<String> {
    let backup = if encrypted {
        session.export_encrypted::<T>().await?
    } else {
        session.export_plain::<T>().await?
    };
    Ok(serialize_backup(&backup)?)
}

fn print_readings(readings: &Collection<Reading>) {
    if readings.is_empty() {
        println!("No readings stored.");
        return;
    }

    let id_width = readings
        .iter()
        .map(|r| r.id.len())
        .chain(std::iter::once("Id".len()))
        .max()
        .unwrap_or_default();

    println!("{:<id_width$}  {:<16}  {:>7}  {:>5}  Notes", "Id", "Taken", "BP", "Pulse");
    println!("{:-<id_width$}  {:-<16}  {:->7}  {:->5}  {:-<5}", "", "", "", "", "");
    for r in readings {
        let bp = format!("{}/{}", r.systolic, r.diastolic);
        println!(
            "{:<id_width$}  {:<16}  {:>7}  {:>5}  {}",
            r.id,
            r.timestamp.format("%Y-%m-%d %H:%M").to_string(),
            bp,
            r.pulse,
            r.notes
        );
    }
}

fn print_medications(medications: &Collection<Medication>) {
    if medications.is_empty() {
        println!("No medications stored.");
        return;
    }

    for m in medications {
        match &m.time_of_day {
            Some(time) => println!("{}  {} {} ({}, {time})", m.id, m.name, m.dosage, m.frequency),
            None => println!("{}  {} {} ({})", m.id, m.name, m.dosage, m.frequency),
        }
    }
}
