use std::collections::BTreeMap;
use std::env;
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use log::{debug, error, info};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, Stdout};
use urllib::{DataType, RequestBody, RequestOptions, Response, ResponseData, Timeout};

#[derive(Debug, Error)]
enum ArgumentError {
    #[error("header `{header}` is not in `name: value` form")]
    MalformedHeader { header: String },
    #[error("header `{header}` is invalid. Cause: {cause}")]
    InvalidHeader { header: String, cause: String },
    #[error("data `{pair}` is not in `key=value` form")]
    MalformedData { pair: String },
    #[error("unknown method `{method}`")]
    InvalidMethod { method: String },
    #[error("only one of --data-raw and --data-file can be given")]
    ConflictingBodies,
}

type DynError = Box<dyn Error>;

#[derive(Debug, Parser)]
#[command(
    author,
    about,
    version,
    long_about = None,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send one request and print the response body
    Request(RequestArgs),
    /// Start the scripted development server
    Serve {
        /// The ip to listen on.
        /// Default: 127.0.0.1
        #[clap(short, long, default_value = "127.0.0.1")]
        ip: IpAddr,

        /// The port the http server should bind to.
        /// Default: 3000
        #[clap(short, long, default_value = "3000")]
        port: u16,
    },
}

#[derive(Debug, clap::Args)]
struct RequestArgs {
    url: String,

    /// Request method.
    /// Default: GET
    #[clap(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra header, `name: value`. Repeatable.
    #[clap(short = 'H', long = "header")]
    headers: Vec<String>,

    /// `key=value` pair sent in the query (GET-like methods) or as a form body.
    /// Repeatable.
    #[clap(short = 'd', long = "data")]
    data: Vec<String>,

    /// Raw request body
    #[clap(long)]
    data_raw: Option<String>,

    /// Stream the request body from a file
    #[clap(long)]
    data_file: Option<PathBuf>,

    /// Encode `--data` pairs as a JSON object instead of a form
    #[clap(long)]
    json_body: bool,

    /// Parse the response body as JSON
    #[clap(long)]
    json: bool,

    /// Decode the response body as text
    #[clap(long)]
    text: bool,

    /// Limit for both the connect and the response phase, in milliseconds
    #[clap(long)]
    timeout: Option<u64>,

    /// Limit until the response head arrives, in milliseconds
    #[clap(long)]
    connect_timeout: Option<u64>,

    /// Limit from the response head to the end of the body, in milliseconds
    #[clap(long)]
    response_timeout: Option<u64>,

    /// Follow redirects
    #[clap(short = 'L', long)]
    location: bool,

    /// Redirect hops to follow before giving up.
    /// Default: 10
    #[clap(long, default_value = "10")]
    max_redirects: u32,

    /// Ask for and inflate gzip/deflate bodies
    #[clap(long)]
    gzip: bool,

    /// Basic auth credentials, `user:password`
    #[clap(short = 'u', long)]
    user: Option<String>,

    /// Skip TLS certificate verification
    #[clap(short = 'k', long)]
    insecure: bool,

    /// Write the body to a file instead of stdout
    #[clap(short = 'o', long)]
    output: Option<PathBuf>,

    /// Print the body as it arrives
    #[clap(long)]
    stream: bool,

    /// Print status and response headers
    #[clap(short = 'i', long)]
    include: bool,
}

#[tokio::main]
async fn main() {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info")
    }

    env_logger::init();

    if let Err(error) = try_main().await {
        error!("{error}");
        std::process::exit(1);
    }
}

async fn try_main() -> Result<(), DynError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Request(args) => request(args).await,
        Commands::Serve { ip, port } => serve(ip, port).await,
    }
}

async fn serve(ip: IpAddr, port: u16) -> Result<(), DynError> {
    let server = development_server::start(
        development_server::default_router(),
        SocketAddr::new(ip, port),
    )
    .await?;
    info!("press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}

async fn request(args: RequestArgs) -> Result<(), DynError> {
    let include = args.include;
    let url = args.url.clone();
    let options = build_options(args).await?;
    debug!("{options:?}");

    let response = urllib::request(url, options)
        .await
        .map_err(|e| format!("{} (status {}): {}", e.name(), e.status(), e))?;

    let mut stdout = tokio::io::stdout();
    if include {
        print_head(&mut stdout, &response).await?;
    }
    print_body(&mut stdout, response).await?;
    stdout.flush().await?;
    Ok(())
}

async fn build_options(args: RequestArgs) -> Result<RequestOptions, DynError> {
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes()).map_err(|_| {
        ArgumentError::InvalidMethod {
            method: args.method.clone(),
        }
    })?;

    let content = match (args.data_raw, args.data_file) {
        (Some(_), Some(_)) => return Err(ArgumentError::ConflictingBodies.into()),
        (Some(raw), None) => RequestBody::Bytes(raw.into()),
        (None, Some(path)) => RequestBody::from_reader(tokio::fs::File::open(path).await?),
        (None, None) => RequestBody::Empty,
    };

    let data = if args.data.is_empty() {
        None
    } else {
        Some(parse_data(&args.data)?)
    };

    let timeout = match (args.timeout, args.connect_timeout, args.response_timeout) {
        (_, None, None) => args.timeout.map(Timeout::from_millis),
        (fallback, connect, response) => {
            let fallback = fallback.map(Duration::from_millis);
            Some(Timeout {
                connect: connect.map(Duration::from_millis).or(fallback),
                response: response.map(Duration::from_millis).or(fallback),
            })
        }
    };

    let data_type = if args.json {
        DataType::Json
    } else if args.text {
        DataType::Text
    } else {
        DataType::Raw
    };

    let write_stream = match args.output {
        Some(path) => {
            let file = tokio::fs::File::create(&path).await?;
            info!("writing body to {}", path.display());
            Some(Box::new(file) as urllib::WriteStream)
        }
        None => None,
    };

    Ok(RequestOptions {
        method,
        headers: parse_headers(&args.headers)?,
        data,
        content,
        content_type: args.json_body.then(|| "json".to_string()),
        data_type,
        timeout,
        follow_redirect: args.location,
        max_redirects: args.max_redirects,
        gzip: args.gzip,
        auth: args.user,
        reject_unauthorized: !args.insecure,
        write_stream,
        streaming: args.stream,
        ..Default::default()
    })
}

fn parse_headers(raw: &[String]) -> Result<HeaderMap, ArgumentError> {
    let mut headers = HeaderMap::new();
    for header in raw {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| ArgumentError::MalformedHeader {
                header: header.clone(),
            })?;
        let invalid = |cause: String| ArgumentError::InvalidHeader {
            header: header.clone(),
            cause,
        };
        let name =
            HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let value =
            HeaderValue::from_str(value.trim()).map_err(|e| invalid(e.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn parse_data(raw: &[String]) -> Result<BTreeMap<String, String>, ArgumentError> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| ArgumentError::MalformedData { pair: pair.clone() })
        })
        .collect()
}

async fn print_head(stdout: &mut Stdout, response: &Response) -> Result<(), DynError> {
    let mut head = format!("{:?} {}\n", http::Version::HTTP_11, response.status);
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\n"));
    }
    head.push('\n');
    stdout.write_all(head.as_bytes()).await?;
    Ok(())
}

async fn print_body(stdout: &mut Stdout, response: Response) -> Result<(), DynError> {
    match response.data {
        None => {}
        Some(ResponseData::Bytes(bytes)) => stdout.write_all(&bytes).await?,
        Some(ResponseData::Text(text)) => stdout.write_all(text.as_bytes()).await?,
        Some(ResponseData::Json(value)) => {
            let pretty = serde_json::to_string_pretty(&value)?;
            stdout.write_all(pretty.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        Some(ResponseData::Stream(mut stream)) => {
            while let Some(chunk) = stream.next().await {
                stdout.write_all(&chunk?).await?;
                stdout.flush().await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn headers_parse_as_name_value_pairs() {
        let headers = parse_headers(&[
            "Accept: application/json".to_string(),
            "x-a: 1".to_string(),
            "x-a: 2".to_string(),
        ])
        .unwrap();
        assert_eq!(headers["accept"], "application/json");
        assert_eq!(headers.get_all("x-a").iter().count(), 2);

        let err = parse_headers(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, ArgumentError::MalformedHeader { .. }));
    }

    #[test]
    fn data_pairs_need_an_equals_sign() {
        let data = parse_data(&["a=1".to_string(), "b=x=y".to_string()]).unwrap();
        assert_eq!(data["a"], "1");
        assert_eq!(data["b"], "x=y");
        assert!(parse_data(&["a".to_string()]).is_err());
    }

    #[tokio::test]
    async fn split_timeouts_fall_back_to_the_scalar() {
        let args = Cli::parse_from([
            "urllib-cli",
            "request",
            "http://127.0.0.1/",
            "--timeout",
            "500",
            "--connect-timeout",
            "100",
        ]);
        let Commands::Request(args) = args.command else {
            panic!("expected the request command");
        };
        let options = build_options(args).await.unwrap();
        assert_eq!(
            options.timeout,
            Some(Timeout::split(
                Duration::from_millis(100),
                Duration::from_millis(500)
            ))
        );
    }
}
