//! Subcommands and their output.

use std::io::{Read, Write};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use fedfs_kernel::provider::encode_timestamp;
use fedfs_kernel::{CreateMode, FederatedFs, NodeType, RemoveMode, Resource, ResourcePath};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the existing tree (or the subtree at PATH)
    Tree { path: Option<String> },

    /// Create a root
    Mkroot {
        name: String,
        /// Provider id for everything under the root
        #[arg(long)]
        provider: Option<String>,
    },

    /// Create a folder
    Mkdir {
        path: String,
        /// Create missing ancestors as folders
        #[arg(short, long)]
        parents: bool,
    },

    /// Create an empty file
    Touch { path: String },

    /// Write TEXT (or stdin) to a file
    Write {
        path: String,
        text: Option<String>,
        #[arg(short, long)]
        append: bool,
        /// Push the write upstream as well
        #[arg(long)]
        write_through: bool,
    },

    /// Print file content
    Cat { path: String },

    /// Remove a resource and everything under it
    Rm {
        path: String,
        /// Also purge cached content
        #[arg(short, long)]
        force: bool,
    },

    /// Show resource metadata
    Stat { path: String },

    /// Show the effective provider and its root
    Resolve { path: String },

    /// Persistent properties
    #[command(subcommand)]
    Prop(PropCommand),

    /// Remote URIs
    #[command(subcommand)]
    Uri(UriCommand),

    /// Write pending metadata changes
    Flush,
}

#[derive(Subcommand, Debug)]
pub enum PropCommand {
    Get { path: String, key: String },
    Set { path: String, key: String, value: String },
    Rm { path: String, key: String },
    List { path: String },
}

#[derive(Subcommand, Debug)]
pub enum UriCommand {
    /// Tag a resource with a remote URI (omit URI to clear)
    Set { path: String, uri: Option<String> },
    /// List paths tagged with URI
    Find {
        uri: String,
        #[arg(long)]
        prefix: Option<String>,
    },
}

pub fn run(fs: &FederatedFs, command: Command, input: &mut dyn Read, out: &mut dyn Write) -> Result<()> {
    match command {
        Command::Tree { path } => {
            let starts = match path {
                Some(path) => vec![existing(fs, &path)?],
                None => fs.roots(),
            };
            for start in starts {
                print_tree(&start, 0, out)?;
            }
        }
        Command::Mkroot { name, provider } => {
            let root = fs.add_root(&name, provider.as_deref())?;
            writeln!(out, "{}", root.path())?;
        }
        Command::Mkdir { path, parents } => {
            let path = ResourcePath::parse(&path)?;
            if parents {
                for depth in 1..path.len() {
                    let ancestor = path.prefix(depth);
                    if !fs.resource_at(&ancestor)?.exists() {
                        create(fs, &ancestor, NodeType::Folder)?;
                    }
                }
            }
            create(fs, &path, NodeType::Folder)?;
        }
        Command::Touch { path } => {
            let path = ResourcePath::parse(&path)?;
            let res = fs.resource_at(&path)?;
            if !res.exists() {
                create(fs, &path, NodeType::File)?;
            }
        }
        Command::Write {
            path,
            text,
            append,
            write_through,
        } => {
            let res = existing(fs, &path)?;
            let data = match text {
                Some(text) => text.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    input.read_to_end(&mut buf).context("reading stdin")?;
                    buf
                }
            };
            if write_through {
                res.set_session_flag(fedfs_kernel::WRITE_THROUGH_FLAG, true)?;
            }
            let outcome = res.write_all(&data, append)?;
            tracing::debug!(path = %res.path(), bytes = data.len(), upstream = ?outcome.upstream, "wrote");
            if let fedfs_kernel::UpstreamStatus::Failed(reason) = outcome.upstream {
                bail!("{}: written to cache, upstream push failed: {reason}", res.path());
            }
        }
        Command::Cat { path } => {
            let res = existing(fs, &path)?;
            out.write_all(&res.read_all()?)?;
        }
        Command::Rm { path, force } => {
            let res = existing(fs, &path)?;
            let mode = if force { RemoveMode::Force } else { RemoveMode::Detach };
            res.remove(mode)?;
        }
        Command::Stat { path } => {
            let res = existing(fs, &path)?;
            let meta = res.metadata()?;
            writeln!(out, "path:            {}", meta.path)?;
            writeln!(out, "type:            {}", meta.node_type)?;
            writeln!(out, "local only:      {}", meta.local_only)?;
            writeln!(out, "provider:        {}", meta.provider_id)?;
            writeln!(out, "read only:       {}", meta.read_only)?;
            if let Some(ts) = meta.timestamp {
                writeln!(out, "timestamp:       {}", encode_timestamp(ts))?;
            }
            writeln!(out, "exists remotely: {}", meta.exists_remotely)?;
            writeln!(out, "locked:          {}", meta.locked)?;
            if let Some(content_type) = meta.content_type {
                writeln!(out, "content type:    {content_type}")?;
            }
            if let Ok(Some(uri)) = res.remote_uri() {
                writeln!(out, "remote uri:      {uri}")?;
            }
        }
        Command::Resolve { path } => {
            let resolved = fs.resource(&path)?.provider()?;
            writeln!(out, "{} {}", resolved.id(), resolved.root())?;
        }
        Command::Prop(PropCommand::Get { path, key }) => {
            let res = existing(fs, &path)?;
            match res.persistent_property(&key)? {
                Some(value) => writeln!(out, "{value}")?,
                None => bail!("{}: property {key:?} not set", res.path()),
            }
        }
        Command::Prop(PropCommand::Set { path, key, value }) => {
            existing(fs, &path)?.set_persistent_property(&key, &value)?;
        }
        Command::Prop(PropCommand::Rm { path, key }) => {
            let res = existing(fs, &path)?;
            if res.remove_persistent_property(&key)?.is_none() {
                bail!("{}: property {key:?} not set", res.path());
            }
        }
        Command::Prop(PropCommand::List { path }) => {
            for (key, value) in existing(fs, &path)?.persistent_properties()? {
                writeln!(out, "{key}={value}")?;
            }
        }
        Command::Uri(UriCommand::Set { path, uri }) => {
            existing(fs, &path)?.set_remote_uri(uri.as_deref())?;
        }
        Command::Uri(UriCommand::Find { uri, prefix }) => {
            let prefix = prefix.as_deref().map(ResourcePath::parse).transpose()?;
            for path in fs.paths_for_uri(&uri, prefix.as_ref()) {
                writeln!(out, "{path}")?;
            }
        }
        Command::Flush => fs.flush()?,
    }
    Ok(())
}

/// Handle for `path`, which must exist.
fn existing(fs: &FederatedFs, path: &str) -> Result<Resource> {
    let res = fs.resource(path)?;
    if !res.exists() {
        bail!("{}: no such resource", res.path());
    }
    Ok(res)
}

fn create(fs: &FederatedFs, path: &ResourcePath, node_type: NodeType) -> Result<Resource> {
    let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
        bail!("{path}: cannot create the workspace");
    };
    if parent.is_empty() {
        bail!("{path}: top-level resources are roots; use mkroot");
    }
    let parent = fs.resource_at(&parent)?;
    if !parent.exists() {
        bail!("{}: no such resource", parent.path());
    }
    Ok(parent.create_child(name, node_type, CreateMode::Local)?)
}

fn print_tree(res: &Resource, depth: usize, out: &mut dyn Write) -> Result<()> {
    let name = res.name().unwrap_or("/");
    write!(out, "{:indent$}{name} ({})", "", res.node_type()?, indent = depth * 2)?;
    if let Some(provider) = res.assigned_provider_id()? {
        write!(out, " -> {provider}")?;
    }
    writeln!(out)?;
    for child in res.children()? {
        print_tree(&child, depth + 1, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(fs: &FederatedFs, command: Command) -> Result<String> {
        let mut out = Vec::new();
        run(fs, command, &mut std::io::empty(), &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_build_and_print_tree() {
        let fs = FederatedFs::in_memory().unwrap();
        exec(&fs, Command::Mkroot { name: "P".into(), provider: None }).unwrap();
        exec(&fs, Command::Mkdir { path: "/P/a/b".into(), parents: true }).unwrap();
        exec(&fs, Command::Touch { path: "/P/a/f".into() }).unwrap();

        let tree = exec(&fs, Command::Tree { path: None }).unwrap();
        assert_eq!(tree, "P (project)\n  a (folder)\n    b (folder)\n    f (file)\n");
    }

    #[test]
    fn test_write_then_cat() {
        let fs = FederatedFs::in_memory().unwrap();
        exec(&fs, Command::Mkroot { name: "P".into(), provider: None }).unwrap();
        exec(&fs, Command::Touch { path: "/P/f".into() }).unwrap();

        let mut input: &[u8] = b"from stdin";
        run(
            &fs,
            Command::Write { path: "/P/f".into(), text: None, append: false, write_through: false },
            &mut input,
            &mut Vec::new(),
        )
        .unwrap();
        exec(
            &fs,
            Command::Write { path: "/P/f".into(), text: Some("!".into()), append: true, write_through: false },
        )
        .unwrap();

        assert_eq!(exec(&fs, Command::Cat { path: "/P/f".into() }).unwrap(), "from stdin!");
    }

    #[test]
    fn test_missing_resources_are_errors() {
        let fs = FederatedFs::in_memory().unwrap();
        assert!(exec(&fs, Command::Cat { path: "/P/f".into() }).is_err());
        assert!(exec(&fs, Command::Mkdir { path: "/P/a".into(), parents: false }).is_err());
        assert!(exec(&fs, Command::Touch { path: "/top".into() }).is_err());
    }

    #[test]
    fn test_props_uris_and_resolve() {
        let fs = FederatedFs::in_memory().unwrap();
        exec(&fs, Command::Mkroot { name: "P".into(), provider: None }).unwrap();
        exec(&fs, Command::Touch { path: "/P/f".into() }).unwrap();

        exec(&fs, Command::Prop(PropCommand::Set { path: "/P/f".into(), key: "k".into(), value: "v".into() })).unwrap();
        assert_eq!(
            exec(&fs, Command::Prop(PropCommand::Get { path: "/P/f".into(), key: "k".into() })).unwrap(),
            "v\n"
        );
        assert!(exec(&fs, Command::Prop(PropCommand::Get { path: "/P/f".into(), key: "x".into() })).is_err());

        exec(&fs, Command::Uri(UriCommand::Set { path: "/P/f".into(), uri: Some("u://f".into()) })).unwrap();
        assert_eq!(
            exec(&fs, Command::Uri(UriCommand::Find { uri: "u://f".into(), prefix: None })).unwrap(),
            "/P/f\n"
        );

        assert_eq!(exec(&fs, Command::Resolve { path: "/P/f".into() }).unwrap(), "default /P\n");

        exec(&fs, Command::Rm { path: "/P/f".into(), force: true }).unwrap();
        assert!(exec(&fs, Command::Stat { path: "/P/f".into() }).is_err());
    }
}
