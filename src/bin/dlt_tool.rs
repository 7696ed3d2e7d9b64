use std::path::PathBuf;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use dlt::{
    cluster::ClusterMap,
    config::Config,
    dlt::{token_of_key, Dlt, ObjectId, Serializable},
    placement::{DataPlacement, Outcome},
    telemetry,
};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Parser)]
#[command(name = "dlt-tool")]
#[command(about = "computes and inspects data lookup tables", long_about = None)]
struct Cli {
    /// OTLP collector to export spans to (eg: http://localhost:4317)
    #[arg(long, global = true)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Computes the next table for a cluster map and writes it to `out`
    #[command()]
    Compute {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        cluster: PathBuf,
        /// Table to compute the update from. Without it, a new lineage is started
        #[arg(long)]
        base: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prints a serialized table
    #[command()]
    Show {
        table: PathBuf,
        /// Prints the serialized bytes, hex encoded
        #[arg(long = "hex")]
        as_hex: bool,
    },
    /// Prints the token and replicas of a key
    #[command()]
    Locate { table: PathBuf, key: String },
}

async fn read_table(path: &PathBuf) -> anyhow::Result<Dlt> {
    let serialized = tokio::fs::read(path).await?;
    Ok(Dlt::deserialize(Bytes::from(serialized))?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    telemetry::initialize_subscriber(args.otlp_endpoint.as_deref())?;

    let mut stdout = tokio::io::stdout();
    match args.command {
        Commands::Compute {
            config,
            cluster,
            base,
            out,
        } => {
            let config = Config::from_json(&tokio::fs::read_to_string(config).await?)?;
            let cluster = ClusterMap::from_json(&tokio::fs::read_to_string(cluster).await?)?;
            let mut placement = DataPlacement::from_config(&config)?;
            if let Some(base) = base {
                placement.manager().add(read_table(&base).await?, |_| {})?;
            }

            match placement.compute_dlt(&cluster)? {
                Outcome::Unchanged => {
                    stdout
                        .write_all(b"membership unchanged, nothing to do\n")
                        .await?;
                }
                Outcome::Changed => {
                    if let Some(diff) = placement.get_target_diff() {
                        let changed = format!("{} rows changed\n", diff.delta().len());
                        stdout.write_all(changed.as_bytes()).await?;
                    }
                    placement.commit(|_| {})?;
                    let serialized = placement.persist()?;
                    tokio::fs::write(&out, &serialized).await?;

                    let lease = placement.get_committed()?;
                    stdout.write_all(format!("{}", *lease).as_bytes()).await?;
                }
            }
        }
        Commands::Show { table, as_hex } => {
            let dlt = read_table(&table).await?;
            if as_hex {
                let encoded = format!("{}\n", hex::encode(dlt.serialize()));
                stdout.write_all(encoded.as_bytes()).await?;
            } else {
                stdout.write_all(format!("{}", dlt).as_bytes()).await?;
            }
        }
        Commands::Locate { table, key } => {
            let dlt = read_table(&table).await?;
            let object_id = ObjectId::from_key(key.as_bytes());
            let token = token_of_key(key.as_bytes(), dlt.width());
            let nodes: Vec<String> = dlt
                .nodes_for(token)
                .iter()
                .map(|node| node.to_string())
                .collect();
            let line = format!(
                "object {} token {} replicas [{}]\n",
                hex::encode(object_id.0.to_be_bytes()),
                token,
                nodes.join(", ")
            );
            stdout.write_all(line.as_bytes()).await?;
        }
    }

    stdout.flush().await?;
    telemetry::shutdown();
    Ok(())
}
