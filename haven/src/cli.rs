use anyhow::Result;
use clap::Parser;
use overlay_node::Multiaddr;
use std::env::current_dir;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Opts {
    /// The port of the HTTPS interface.
    #[clap(short = 'p', long = "port", default_value = "8080")]
    pub http_port: u16,

    /// The port of the overlay node's TCP interface.
    #[clap(long = "p-tcp", default_value = "8079")]
    pub node_tcp: u16,

    /// The port of the overlay node's UDP (QUIC) interface.
    #[clap(long = "p-udp", default_value = "8078")]
    pub node_udp: u16,

    /// The multiaddress of the bootstrap node. Leave empty to start as a
    /// seed node and print addresses others can bootstrap against.
    #[clap(short = 'b', long = "bootstrap", default_value = "")]
    bootstrap: String,

    /// The key-sharing group topic. Leave empty to generate a fresh one and
    /// print it for out-of-band sharing.
    #[clap(short = 'g', long = "group", default_value = "")]
    pub group: String,

    /// The base URL of the ledger gateway.
    #[clap(long, default_value = "https://arweave.net")]
    pub gateway: String,

    /// Where to permanently store data, defaults to the current working directory.
    #[clap(long)]
    data_dir: Option<PathBuf>,

    /// If enabled logs will be in json format
    #[clap(short, long)]
    pub json: bool,
}

impl Opts {
    pub fn read() -> Opts {
        Opts::parse()
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = match self.data_dir.clone() {
            None => current_dir()?.join("data"),
            Some(path) => path,
        };

        Ok(data_dir)
    }

    pub fn bootstrap(&self) -> Result<Option<Multiaddr>> {
        if self.bootstrap.is_empty() {
            return Ok(None);
        }

        let addr = self.bootstrap.parse::<Multiaddr>()?;

        Ok(Some(addr))
    }
}
