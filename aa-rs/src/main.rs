use aa_pipeline::encoding::{self, fmt_address, fmt_h256, fmt_u256, user_op_to_json};
use aa_pipeline::submit::handle_ops_calldata;
use aa_pipeline::{
    load_deployment, DeploymentConfig, EthersLedger, FeePolicy, GasLimits, Intent, Ledger,
    Pipeline, ReceiptWait, SenderSpec, TargetCall,
};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::prelude::*;
use ethers::utils::parse_ether;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

// In --json mode stdout carries a single JSON object; human-readable output goes to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "aa-pipeline", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual smart account address, deployment status and deposit.
    Account(AccountArgs),

    /// Ask the EntryPoint (getSenderAddress) where the account would be deployed.
    SenderAddress(AccountArgs),

    /// Build, price, sign and submit a UserOperation via handleOps.
    Send(SendArgs),

    /// Top up the smart account's EntryPoint deposit.
    Deposit(DepositArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Deployment artifact (chainId, rpc, entryPoint, factory).
    #[arg(long, default_value = "deployments/local.json", env = "AA_PIPELINE_DEPLOYMENT")]
    deployment: PathBuf,

    /// Override the chain RPC URL (otherwise uses deployment JSON).
    #[arg(long, env = "AA_PIPELINE_RPC_URL")]
    rpc: Option<String>,

    /// Smart account owner private key.
    ///
    /// Recommended: set via env var AA_PIPELINE_OWNER_PRIVATE_KEY.
    #[arg(long, env = "AA_PIPELINE_OWNER_PRIVATE_KEY")]
    owner_private_key: String,

    /// Key that sends handleOps / depositTo transactions. Defaults to the owner key.
    #[arg(long, env = "AA_PIPELINE_SENDER_PRIVATE_KEY")]
    sender_private_key: Option<String>,

    /// Factory deployment counter of the account. Defaults to the factory's live nonce.
    #[arg(long)]
    counter: Option<u64>,

    /// Use an already-known account address instead of predicting one.
    #[arg(long, conflicts_with = "counter")]
    account: Option<String>,

    /// Print a single JSON object to stdout. All other output is written to stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Contract the account should call. Without it the operation is a no-op `execute()`.
    #[arg(long)]
    target: Option<String>,

    /// Calldata for --target (hex).
    #[arg(long, default_value = "0x", requires = "target")]
    calldata: String,

    /// Value for --target, in wei.
    #[arg(long, default_value_t = 0, requires = "target")]
    value_wei: u128,

    /// Nonce key (uint192, decimal or 0x-hex).
    #[arg(long, default_value = "0")]
    nonce_key: String,

    /// paymasterAndData to attach verbatim (hex). Uses the deployment's paymaster if it has one.
    #[arg(long, env = "AA_PIPELINE_PAYMASTER_AND_DATA")]
    paymaster_and_data: Option<String>,

    /// Beneficiary of the handleOps gas refund. Defaults to the sender key.
    #[arg(long, env = "AA_PIPELINE_BENEFICIARY")]
    beneficiary: Option<String>,

    #[arg(long, default_value_t = 200_000)]
    call_gas_limit: u64,

    #[arg(long, default_value_t = 1_000_000)]
    verification_gas_limit: u64,

    #[arg(long, default_value_t = 60_000)]
    pre_verification_gas: u64,

    /// Base fee headroom in basis points (e.g. 20000 = 2x).
    #[arg(long, default_value_t = 20_000, env = "AA_PIPELINE_BASE_FEE_MULTIPLIER_BPS")]
    base_fee_multiplier_bps: u64,

    /// Priority fee multiplier in basis points (e.g. 15000 = 1.5x).
    #[arg(long, default_value_t = 10_000, env = "AA_PIPELINE_PRIORITY_FEE_MULTIPLIER_BPS")]
    priority_fee_multiplier_bps: u64,

    /// Priority fee floor in wei.
    #[arg(long, default_value_t = 0)]
    min_priority_fee_wei: u64,

    /// Confirm the predicted sender with getSenderAddress before building.
    #[arg(long, default_value_t = false)]
    confirm_sender: bool,

    /// Check the local userOpHash against the EntryPoint's getUserOpHash before signing.
    #[arg(long, default_value_t = false)]
    confirm_hash: bool,

    /// Do not send; print the signed UserOperation and handleOps calldata.
    #[arg(long)]
    dry_run: bool,

    /// Max seconds to wait for the receipt. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[derive(Args, Debug)]
struct DepositArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Amount in ETH (decimal string).
    #[arg(long)]
    amount_eth: String,

    /// Max seconds to wait for the receipt. Use 0 to disable timeout.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::SenderAddress(args) => cmd_sender_address(args).await,
        Command::Send(args) => cmd_send(args).await,
        Command::Deposit(args) => cmd_deposit(args).await,
    }
}

struct Session {
    dep: DeploymentConfig,
    ledger: Arc<EthersLedger<SignerClient>>,
    owner: LocalWallet,
}

impl Session {
    async fn open(common: &CommonArgs) -> Result<Self> {
        let dep = load_deployment(&common.deployment, common.rpc.clone())?;

        let provider =
            Provider::<Http>::try_from(dep.rpc_url.as_str())?.interval(Duration::from_millis(350));

        let chain_id = provider.get_chainid().await?.as_u64();
        if chain_id != dep.chain_id {
            return Err(anyhow!(
                "chainId mismatch: deployment has {}, RPC returned {}",
                dep.chain_id,
                chain_id
            ));
        }

        let owner = LocalWallet::from_str(&common.owner_private_key)
            .context("invalid owner private key")?
            .with_chain_id(chain_id);
        let sender = match common.sender_private_key.as_deref() {
            Some(pk) => LocalWallet::from_str(pk)
                .context("invalid sender private key")?
                .with_chain_id(chain_id),
            None => owner.clone(),
        };

        let client = Arc::new(SignerMiddleware::new(provider, sender));
        Ok(Self {
            dep,
            ledger: Arc::new(EthersLedger::new(client)),
            owner,
        })
    }

    fn pipeline(&self, policy: FeePolicy) -> Pipeline<EthersLedger<SignerClient>> {
        Pipeline::new(self.ledger.clone(), &self.dep, self.owner.clone(), policy)
    }
}

fn parse_hex_bytes(s: &str, what: &str) -> Result<Bytes> {
    Bytes::from_str(s).with_context(|| format!("invalid {what} hex"))
}

fn parse_u256(s: &str) -> Result<U256> {
    let s = s.trim();
    match s.strip_prefix("0x") {
        Some(h) => U256::from_str_radix(h, 16).map_err(|e| anyhow!("{e}")),
        None => U256::from_dec_str(s).map_err(|e| anyhow!("{e}")),
    }
}

fn sender_spec(common: &CommonArgs) -> Result<SenderSpec> {
    Ok(match common.account.as_deref() {
        Some(a) => SenderSpec::Known(Address::from_str(a).context("invalid --account address")?),
        None => SenderSpec::Counterfactual {
            counter: common.counter,
        },
    })
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let common = &args.common;
    let machine_mode = common.json;
    let session = Session::open(common).await?;
    let pipeline = session.pipeline(FeePolicy::default());
    let oracle = pipeline.builder().oracle();

    let (account, counter) = match sender_spec(common)? {
        SenderSpec::Known(a) => (a, None),
        SenderSpec::Counterfactual { counter } => {
            let counter = match counter {
                Some(c) => c,
                None => oracle.current_counter(session.dep.factory).await?,
            };
            (aa_pipeline::predict(session.dep.factory, counter), Some(counter))
        }
    };
    let deployed = oracle.is_deployed(account).await?;
    let deposit = pipeline.client().balance_of(account).await?;
    let owner = session.owner.address();

    if machine_mode {
        let out = serde_json::json!({
            "owner": fmt_address(owner),
            "smartAccount": fmt_address(account),
            "counter": counter,
            "isDeployed": deployed,
            "deposit": fmt_u256(deposit),
        });
        println!("{}", out);
    }

    outln!(machine_mode, "chainId:        {}", session.dep.chain_id);
    outln!(machine_mode, "entryPoint:     {}", session.dep.entry_point);
    outln!(machine_mode, "factory:        {}", session.dep.factory);
    outln!(machine_mode, "owner:          {}", owner);
    if let Some(c) = counter {
        outln!(machine_mode, "counter:        {}", c);
    }
    outln!(machine_mode, "smartAccount:   {}", account);
    outln!(machine_mode, "isDeployed:     {}", deployed);
    outln!(machine_mode, "deposit (wei):  {}", deposit);

    Ok(())
}

async fn cmd_sender_address(args: AccountArgs) -> Result<()> {
    let common = &args.common;
    let session = Session::open(common).await?;
    let pipeline = session.pipeline(FeePolicy::default());
    let builder = pipeline.builder();

    let init_code = builder.init_code(session.owner.address());
    let from_entry_point = builder
        .oracle()
        .predict_via_simulated_revert(init_code)
        .await
        .context("getSenderAddress failed")?;
    let counter = builder.oracle().current_counter(session.dep.factory).await?;
    let local = aa_pipeline::predict(session.dep.factory, counter);

    if common.json {
        let out = serde_json::json!({
            "entryPoint": fmt_address(from_entry_point),
            "predicted": fmt_address(local),
            "counter": counter,
            "match": local == from_entry_point,
        });
        println!("{}", out);
    } else {
        println!("getSenderAddress: {}", from_entry_point);
        println!("predicted:        {} (counter {})", local, counter);
    }
    if local != from_entry_point {
        tracing::warn!(
            "local prediction differs from the EntryPoint; the factory may not deploy with CREATE"
        );
    }
    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let common = &args.common;
    let machine_mode = common.json;
    let session = Session::open(common).await?;

    let policy = FeePolicy {
        base_fee_multiplier_bps: args.base_fee_multiplier_bps,
        priority_fee_multiplier_bps: args.priority_fee_multiplier_bps.max(1),
        min_priority_fee: U256::from(args.min_priority_fee_wei),
        ..FeePolicy::default()
    };
    let mut pipeline = session.pipeline(policy).with_wait(ReceiptWait {
        timeout: Duration::from_secs(args.max_wait_seconds),
        ..ReceiptWait::default()
    });
    if args.confirm_hash {
        pipeline = pipeline.with_hash_confirmation();
    }

    let target = match args.target.as_deref() {
        Some(t) => TargetCall::Execute {
            dest: Address::from_str(t).context("invalid --target address")?,
            value: U256::from(args.value_wei),
            func: parse_hex_bytes(&args.calldata, "--calldata")?,
        },
        None => TargetCall::Noop,
    };

    let mut intent = Intent::new(session.owner.address(), sender_spec(common)?, target)
        .with_nonce_key(parse_u256(&args.nonce_key).context("invalid --nonce-key")?)
        .with_gas(GasLimits {
            call_gas_limit: U256::from(args.call_gas_limit),
            verification_gas_limit: U256::from(args.verification_gas_limit),
            pre_verification_gas: U256::from(args.pre_verification_gas),
        });
    let paymaster_and_data = match args.paymaster_and_data.as_deref() {
        Some(p) => Some(parse_hex_bytes(p, "--paymaster-and-data")?),
        None => session.dep.paymaster.map(|p| Bytes::from(p.as_bytes().to_vec())),
    };
    if let Some(p) = paymaster_and_data {
        intent = intent.with_paymaster(p);
    }
    if args.confirm_sender {
        intent = intent.with_sender_confirmation();
    }

    let op = pipeline.prepare(&intent).await?;
    outln!(machine_mode, "sender:         {}", op.sender);
    outln!(machine_mode, "nonce:          {}", op.nonce);
    outln!(machine_mode, "deploys:        {}", !op.init_code.is_empty());
    outln!(
        machine_mode,
        "fees:           maxFeePerGas={} maxPriorityFeePerGas={}",
        op.max_fee_per_gas,
        op.max_priority_fee_per_gas
    );

    let signed = pipeline.sign(op).await?;
    let user_op_hash = signed.hash();
    outln!(machine_mode, "userOpHash:     {}", fmt_h256(user_op_hash));

    let beneficiary = match args.beneficiary.as_deref() {
        Some(b) => Address::from_str(b).context("invalid --beneficiary address")?,
        None => pipeline.beneficiary()?,
    };

    if args.dry_run {
        let out = serde_json::json!({
            "userOp": user_op_to_json(signed.op()),
            "userOpHash": fmt_h256(user_op_hash),
            "entryPoint": fmt_address(session.dep.entry_point),
            "handleOpsCalldata":
                encoding::fmt_bytes(&handle_ops_calldata(&[signed.clone()], beneficiary)),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let receipt = pipeline
        .client()
        .submit(&[signed], beneficiary)
        .await
        .context("handleOps failed")?;

    if machine_mode {
        let ops: Vec<_> = receipt
            .operations
            .iter()
            .map(|o| {
                serde_json::json!({
                    "userOpHash": fmt_h256(o.user_op_hash),
                    "sender": fmt_address(o.sender),
                    "nonce": fmt_u256(o.nonce),
                    "success": o.success,
                    "actualGasCost": fmt_u256(o.actual_gas_cost),
                    "actualGasUsed": fmt_u256(o.actual_gas_used),
                    "reason": o.reason(),
                })
            })
            .collect();
        let out = serde_json::json!({
            "txHash": fmt_h256(receipt.tx_hash),
            "success": receipt.all_succeeded(),
            "gasUsed": fmt_u256(receipt.gas_used),
            "operations": ops,
        });
        println!("{}", out);
    }

    outln!(machine_mode, "txHash:         {}", fmt_h256(receipt.tx_hash));
    for o in &receipt.operations {
        match o.reason() {
            Some(reason) => outln!(
                machine_mode,
                "op {}: executed=false reason={}",
                fmt_h256(o.user_op_hash),
                reason
            ),
            None => outln!(
                machine_mode,
                "op {}: executed={} gasCost={}",
                fmt_h256(o.user_op_hash),
                o.success,
                o.actual_gas_cost
            ),
        }
    }

    if !receipt.all_succeeded() {
        return Err(anyhow!("operation included but its call reverted"));
    }
    Ok(())
}

async fn cmd_deposit(args: DepositArgs) -> Result<()> {
    let common = &args.common;
    let session = Session::open(common).await?;
    let pipeline = session.pipeline(FeePolicy::default()).with_wait(ReceiptWait {
        timeout: Duration::from_secs(args.max_wait_seconds),
        ..ReceiptWait::default()
    });
    let client = pipeline.client();

    let account = match sender_spec(common)? {
        SenderSpec::Known(a) => a,
        SenderSpec::Counterfactual { counter } => {
            let counter = match counter {
                Some(c) => c,
                None => {
                    pipeline
                        .builder()
                        .oracle()
                        .current_counter(session.dep.factory)
                        .await?
                }
            };
            aa_pipeline::predict(session.dep.factory, counter)
        }
    };
    let amount = parse_ether(&args.amount_eth).context("invalid --amount-eth")?;
    let from = session
        .ledger
        .sender()
        .ok_or_else(|| anyhow!("no sending key configured"))?;

    let tx = client.deposit_to(account, amount).await?;
    let balance = client.balance_of(account).await?;

    outln!(common.json, "from:           {}", from);
    outln!(common.json, "account:        {}", account);
    outln!(common.json, "txHash:         {}", fmt_h256(tx));
    outln!(common.json, "deposit (wei):  {}", balance);
    if common.json {
        println!(
            "{}",
            serde_json::json!({
                "account": fmt_address(account),
                "txHash": fmt_h256(tx),
                "deposit": fmt_u256(balance),
            })
        );
    }
    Ok(())
}
