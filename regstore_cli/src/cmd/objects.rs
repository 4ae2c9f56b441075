use anyhow::{Context, Result, bail};
use chrono::{TimeDelta, Utc};
use futures::StreamExt;
use regstore_core::{StorageDriver, UrlOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::Commands;

pub async fn run_object_command<D: StorageDriver>(driver: &D, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Get { path, out } => {
            let content = driver
                .get_content(&path)
                .await
                .with_context(|| format!("failed to get {path}"))?;
            match out {
                Some(out) => {
                    tokio::fs::write(&out, &content)
                        .await
                        .with_context(|| format!("failed to write to {}", out.display()))?;
                    println!("wrote {} bytes to {}", content.len(), out.display());
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&content).await?;
                    stdout.flush().await?;
                }
            }
        }
        Commands::Put { path, file } => {
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let len = content.len();
            driver
                .put_content(&path, content.into())
                .await
                .with_context(|| format!("failed to put {path}"))?;
            println!("stored {len} bytes at {path}");
        }
        Commands::Read { path, offset } => {
            let mut stream = driver
                .read_stream(&path, offset)
                .await
                .with_context(|| format!("failed to open {path}"))?;
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = stream.next().await {
                stdout.write_all(&chunk?).await?;
            }
            stdout.flush().await?;
        }
        Commands::Write { path, file, offset } => {
            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("failed to open {}", file.display()))?;
            match driver
                .write_stream(&path, offset, Box::new(ReaderStream::new(source)))
                .await
            {
                Ok(consumed) => println!("wrote {consumed} bytes to {path} at offset {offset}"),
                Err(err) => {
                    bail!(
                        "write to {path} failed after {} bytes, resume at offset {}: {}",
                        err.consumed,
                        offset + err.consumed,
                        err.source
                    );
                }
            }
        }
        Commands::Stat { path } => {
            let info = driver
                .stat(&path)
                .await
                .with_context(|| format!("failed to stat {path}"))?;
            let kind = if info.is_dir { "directory" } else { "file" };
            let mod_time = info
                .mod_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            println!("{}\t{kind}\t{}\t{mod_time}", info.path, info.size);
        }
        Commands::Ls { path } => {
            for child in driver
                .list(&path)
                .await
                .with_context(|| format!("failed to list {path}"))?
            {
                println!("{child}");
            }
        }
        Commands::Mv { source, dest } => {
            driver
                .move_path(&source, &dest)
                .await
                .with_context(|| format!("failed to move {source} to {dest}"))?;
            println!("moved {source} to {dest}");
        }
        Commands::Rm { path } => {
            driver
                .delete(&path)
                .await
                .with_context(|| format!("failed to delete {path}"))?;
            println!("deleted {path}");
        }
        Commands::Url {
            path,
            method,
            expires_in,
        } => {
            let expiry = match expires_in {
                Some(secs) => Some(
                    TimeDelta::try_seconds(secs)
                        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                        .with_context(|| format!("--expires-in {secs} is out of range"))?,
                ),
                None => None,
            };
            let options = UrlOptions {
                method: Some(method),
                expiry,
            };
            let url = driver
                .url_for(&path, options)
                .await
                .with_context(|| format!("failed to sign a URL for {path}"))?;
            println!("{url}");
        }
        Commands::Config { .. } => bail!("config commands do not run against a driver"),
    }
    Ok(())
}
