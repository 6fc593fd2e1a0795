const USAGE: &str = "\
Object Copy Proxy — copy-on-demand proxy between two object storage buckets

Serves objects from whichever bucket already has them while replicating the
source object into the destination bucket in the background. Intended to run
close to the destination region to cut cross-region traffic.

USAGE:
    ocp [OPTIONS]

OPTIONS:
    -h, --help       Print this help message and exit
    -v, --version    Print version and exit

REQUIRED ENVIRONMENT VARIABLES:
    OCP_SOURCE_URL            Source bucket base URL to replicate from
    OCP_REGION                Region of the destination bucket
    OCP_BUCKET                Destination bucket name

NETWORK (listen addresses, default shown):
    OCP_LISTEN                Proxy HTTP listener          [:8080]
    OCP_METRICS_LISTEN        Prometheus metrics           [:9100]

REPLICATION:
    OCP_PREFIX                Key prefix applied inside the destination bucket
    OCP_MAX_WAIT              Default wait bound for requests that arrive
                              while a copy is in flight    [90s]
    OCP_UPLOAD_ACL            public-read | private        [public-read]

DESTINATION BUCKET ACCESS:
    OCP_BUCKET_PUBLIC_URL     Redirect base URL            [https://<bucket>.s3.<region>.amazonaws.com]
    OCP_S3_ENDPOINT           Custom S3 endpoint (MinIO and friends)
    OCP_S3_FORCE_PATH_STYLE   Path-style addressing        [false]

    AWS credentials come from the standard environment variables.

OTHER:
    OCP_METADATA_URL          Instance metadata base URL   [http://169.254.169.254]
    OCP_LOG_LEVEL             Log level                    [info]

Requests may lower the wait bound per call with the x-max-wait-duration
header (a duration string such as \"1s\"); values above OCP_MAX_WAIT are
clamped.
";

pub fn print_usage() {
    print!("{USAGE}");
}

pub fn print_version(version: &str) {
    println!("ocp {version}");
}

fn handle_cli_flags_from_args(args: &[String], version: &str) -> bool {
    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                return true;
            }
            "-v" | "--version" => {
                print_version(version);
                return true;
            }
            _ => {}
        }
    }
    false
}

/// Check CLI args for --help/-h or --version/-v.
/// Returns `true` if a flag was handled (caller should exit).
pub fn handle_cli_flags(version: &str) -> bool {
    let args: Vec<String> = std::env::args().skip(1).collect();
    handle_cli_flags_from_args(&args, version)
}
