use mini_redis_batch::{BatchError, Client, Command, Frame, Reply, DEFAULT_PORT};

use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    name = "mini-redis-batch-cli",
    version,
    author,
    about = "以流水线或事务的方式发送一批 Redis 命令"
)]
struct Cli {
    #[clap(subcommand)]
    command: Mode,

    #[clap(name = "hostname", long, default_value = "127.0.0.1")]
    host: String,

    #[clap(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// 等待单个回复的最长毫秒数
    #[clap(long)]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// 一次发送所有命令，按顺序打印回复。
    Pipeline {
        /// 单个命令失败时仍然打印全部结果
        #[clap(long)]
        suppress_errors: bool,

        /// 每个参数是一条完整的命令，例如 "SET key value"
        #[clap(required = true)]
        commands: Vec<String>,
    },
    /// 用 MULTI/EXEC 原子地执行所有命令。
    Transaction {
        /// 在事务开始之前 WATCH 的键
        #[clap(long = "watch")]
        watch: Vec<String>,

        /// 单个命令失败时仍然打印全部结果
        #[clap(long)]
        suppress_errors: bool,

        /// 每个参数是一条完整的命令，例如 "INCR counter"
        #[clap(required = true)]
        commands: Vec<String>,
    },
}

/// CLI 工具的入口点。
///
/// 在这里使用 `flavor = "current_thread"` 是为了避免生成后台线程。
#[tokio::main(flavor = "current_thread")]
async fn main() -> mini_redis_batch::Result<()> {
    // 日志级别由 `RUST_LOG` 控制
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()?;

    let cli = Cli::parse();

    let addr = format!("{}:{}", cli.host, cli.port);
    let timeout = cli.timeout_ms.map(Duration::from_millis);
    let client = Client::connect_with_timeout(&addr, timeout).await?;

    let res = match cli.command {
        Mode::Pipeline {
            suppress_errors,
            commands,
        } => {
            let pipeline = client.pipeline();
            for cmd in parse_commands(&commands)? {
                pipeline.enqueue(cmd)?;
            }
            pipeline.execute(suppress_errors).await
        }
        Mode::Transaction {
            watch,
            suppress_errors,
            commands,
        } => {
            let tx = client.transaction();
            if !watch.is_empty() {
                tx.watch(&watch).await?;
            }
            for cmd in parse_commands(&commands)? {
                tx.enqueue(cmd)?;
            }
            tx.execute(suppress_errors).await
        }
    };

    match res {
        Ok(replies) => print_replies(&replies),
        Err(BatchError::Failed(failures)) => {
            for failure in &failures {
                println!("{}) (error) {}", failure.index + 1, failure.error);
            }
            return Err(BatchError::Failed(failures).into());
        }
        Err(err) => return Err(err.into()),
    }

    Ok(())
}

fn parse_commands(lines: &[String]) -> mini_redis_batch::Result<Vec<Command>> {
    lines
        .iter()
        .map(|line| Command::parse_line(line).ok_or_else(|| "命令不能为空".into()))
        .collect()
}

fn print_replies(replies: &[Reply]) {
    for (i, reply) in replies.iter().enumerate() {
        match reply {
            Ok(frame) => println!("{}) {}", i + 1, display(frame)),
            Err(err) => println!("{}) (error) {}", i + 1, err),
        }
    }
}

fn display(frame: &Frame) -> String {
    match frame {
        Frame::Bulk(_) => format!("\"{}\"", frame),
        Frame::Integer(n) => format!("(integer) {}", n),
        _ => frame.to_string(),
    }
}
