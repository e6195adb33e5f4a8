use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, SdkConfig};
use clap::Parser;
use lambda_code_storage_monitor::{
    with_invocation_logging, CodeStorageMonitor, InvocationResult, MonitorConfig,
};
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;
use tokio::runtime::Handle;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run one metering pass, print the result and exit instead of
    /// serving Lambda invocations
    #[arg(long)]
    local: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let config = MonitorConfig::from_env()?;
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .retry_config(RetryConfig::standard().with_max_attempts(config.max_attempts.get()))
        .load()
        .await;

    if args.local {
        let result = invoke(&config, &sdk_config, Value::Null).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        if !result.is_success() {
            return Err("code size metering failed".into());
        }
        return Ok(());
    }

    lambda_runtime::run(service_fn(|event| {
        function_handler(event, &config, &sdk_config)
    }))
    .await
}

async fn function_handler(
    event: LambdaEvent<Value>,
    config: &MonitorConfig,
    sdk_config: &SdkConfig,
) -> Result<Value, Error> {
    let result = invoke(config, sdk_config, event.payload).await?;
    if result.is_success() {
        Ok(serde_json::to_value(result)?)
    } else {
        // An error lets the scheduler retry the invocation.
        Err(serde_json::to_string(&result)?.into())
    }
}

/// The monitor blocks on every AWS call, so it runs on a blocking thread
/// with its own logging subscriber.
async fn invoke(
    config: &MonitorConfig,
    sdk_config: &SdkConfig,
    payload: Value,
) -> Result<InvocationResult, Error> {
    let config = config.clone();
    let sdk_config = sdk_config.clone();
    let runtime = Handle::current();

    let result = tokio::task::spawn_blocking(move || {
        with_invocation_logging(config.log_level, || {
            tracing::debug!(%payload, "Invocation received.");
            CodeStorageMonitor::new(&config, &sdk_config, runtime).invoke()
        })
    })
    .await?;
    Ok(result)
}
