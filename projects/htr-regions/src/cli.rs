use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to; the next free port is used if it is taken
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Root directory for images, originals, annotations and projects
    #[arg(long, env = "HTR_DATA_ROOT", default_value = "data")]
    pub data_root: PathBuf,

    /// Background worker threads
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Jobs that may wait for a worker before requests are refused
    #[arg(long, default_value_t = 64)]
    pub queue_depth: usize,

    /// External OCR command; receives a PNG line crop on stdin. Shell-style
    /// quoting is honoured, e.g. `"/opt/My OCR/ocr" --lang ru`
    #[arg(long, env = "HTR_RECOGNIZER_CMD")]
    pub recognizer_cmd: Option<String>,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["htr-regions"]).unwrap();
        assert_eq!(args.port, 5000);
        assert_eq!(args.workers, 4);
        assert_eq!(args.queue_depth, 64);
    }

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from([
            "htr-regions",
            "--port",
            "8080",
            "--data-root",
            "/srv/htr",
            "--recognizer-cmd",
            "ocr --line",
        ])
        .unwrap();
        assert_eq!(args.port, 8080);
        assert_eq!(args.data_root, PathBuf::from("/srv/htr"));
        assert_eq!(args.recognizer_cmd.as_deref(), Some("ocr --line"));
    }
}
