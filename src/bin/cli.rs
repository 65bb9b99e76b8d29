use anyhow::Context;
use clap::{Parser, Subcommand};
use env_logger::Env;
use mailauth_engine::dkim::{DkimKeyStatus, ProbeStatus};
use mailauth_engine::dmarc::DmarcOutcome;
use mailauth_engine::domain::domain_of_address;
use mailauth_engine::{AuthRequest, Authenticator, DkimSignatureRef, DomainName, EngineConfig, SpfRequest};
use serde::Serialize;
use std::net::IpAddr;

#[derive(Parser)]
#[command(about = "SPF, DKIM and DMARC checks from DNS")]
struct Cli {
    /// Output JSON
    #[arg(long, global = true)]
    json: bool,

    /// Nameserver to query (repeatable); overrides MAILAUTH_NAMESERVERS
    #[arg(long = "nameserver", global = true)]
    nameservers: Vec<IpAddr>,

    /// Per-evaluation deadline in seconds
    #[arg(long, global = true)]
    deadline: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate SPF for a connecting IP
    Spf {
        domain: String,
        ip: IpAddr,
        #[arg(long)]
        helo: Option<String>,
        /// Full MAIL FROM address, for macro expansion
        #[arg(long)]
        sender: Option<String>,
    },
    /// Fetch a DKIM key, or probe common selectors when none is given
    Dkim {
        domain: String,
        #[arg(short, long)]
        selector: Option<String>,
    },
    /// Discover the DMARC policy for a domain
    Dmarc { domain: String },
    /// Run SPF, DKIM and DMARC together and compute the disposition
    Evaluate {
        /// RFC5322.From domain
        #[arg(long)]
        from: String,
        #[arg(long)]
        ip: IpAddr,
        /// MAIL FROM address or domain; defaults to the From domain
        #[arg(long)]
        mail_from: Option<String>,
        #[arg(long)]
        helo: Option<String>,
        /// DKIM signature as `selector:domain` (repeatable)
        #[arg(long = "dkim")]
        signatures: Vec<String>,
        /// Sample in 0..100 used to apply a partial pct=
        #[arg(long)]
        pct_sample: Option<u8>,
    },
}

fn domain(arg: &str) -> anyhow::Result<DomainName> {
    DomainName::parse(arg).with_context(|| format!("invalid domain `{arg}`"))
}

fn print<T: Serialize>(json: bool, value: &T, human: impl FnOnce()) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let mut config = EngineConfig::from_env()?;
    if !cli.nameservers.is_empty() {
        config.nameservers = cli.nameservers.clone();
    }
    if let Some(secs) = cli.deadline {
        config.deadline_secs = secs;
    }
    let auth = Authenticator::from_config(&config)?;

    match cli.command {
        Command::Spf {
            domain: d,
            ip,
            helo,
            sender,
        } => {
            let helo = helo.as_deref().map(domain).transpose()?;
            let request = SpfRequest::new(domain(&d)?, ip).with_helo(helo).with_sender(sender);
            let evaluation = auth.check_spf(&request).await;
            print(cli.json, &evaluation, || {
                println!("SPF {} for {} from {}", evaluation.result, evaluation.domain, evaluation.ip);
                if let Some((at, directive)) = &evaluation.matched {
                    println!("  Matched: {directive} in {at}");
                }
                if let Some(err) = &evaluation.error {
                    println!("  Error ({}): {err}", err.class());
                }
                println!(
                    "  DNS lookups: {}, void lookups: {}",
                    evaluation.state.dns_lookups, evaluation.state.void_lookups
                );
                for line in evaluation.trace.lines("  | ") {
                    println!("{line}");
                }
            })?;
        }
        Command::Dkim {
            domain: d,
            selector: Some(selector),
        } => {
            let lookup = auth.check_dkim(&selector, &domain(&d)?).await;
            print(cli.json, &lookup, || {
                println!("DKIM {}._domainkey.{}", lookup.selector, lookup.domain);
                match &lookup.status {
                    DkimKeyStatus::Valid(key) => {
                        println!("  Valid {} key, {} bytes", key.key_type, key.key_len);
                        if key.is_testing() {
                            println!("  Testing mode (t=y)");
                        }
                    }
                    DkimKeyStatus::Revoked(_) => println!("  Revoked (empty p=)"),
                    DkimKeyStatus::NotFound => println!("  No key published"),
                    DkimKeyStatus::Invalid(reason) => println!("  Invalid: {reason}"),
                    DkimKeyStatus::TempError(err) => println!("  Temporary failure: {err}"),
                }
            })?;
        }
        Command::Dkim {
            domain: d,
            selector: None,
        } => {
            let probe = auth.probe_dkim(&domain(&d)?).await;
            print(cli.json, &probe, || {
                println!("DKIM selector probe for {} (unconfirmed guesses)", probe.domain);
                match probe.status {
                    ProbeStatus::Found => {
                        for lookup in &probe.found {
                            println!("  {}: {}", lookup.selector, lookup.status.summary());
                        }
                    }
                    ProbeStatus::Error => println!("  Nothing found; some selectors could not be checked"),
                    ProbeStatus::NotChecked => println!("  Nothing found among common selectors"),
                }
                for (selector, err) in &probe.errors {
                    println!("  {selector}: {err}");
                }
            })?;
        }
        Command::Dmarc { domain: d } => {
            let discovery = auth.check_dmarc(&domain(&d)?).await;
            print(cli.json, &discovery, || {
                println!("DMARC for {}", discovery.domain);
                match &discovery.outcome {
                    DmarcOutcome::Found {
                        record,
                        source,
                        via_org_fallback,
                    } => {
                        println!("  Record: {record}");
                        if *via_org_fallback {
                            println!("  Inherited from organizational domain {source}");
                        }
                    }
                    DmarcOutcome::NoneFound => println!("  No policy published"),
                    DmarcOutcome::Error(err) => println!("  Error ({}): {err}", err.class()),
                }
            })?;
        }
        Command::Evaluate {
            from,
            ip,
            mail_from,
            helo,
            signatures,
            pct_sample,
        } => {
            let from_domain = domain(&from)?;
            let (spf_domain, sender) = match mail_from {
                Some(addr) if addr.contains('@') => {
                    let d = domain_of_address(&addr).with_context(|| format!("invalid MAIL FROM `{addr}`"))?;
                    (d, Some(addr))
                }
                Some(d) => (domain(&d)?, None),
                None => (from_domain.clone(), None),
            };
            let dkim_signatures = signatures
                .iter()
                .map(|sig| {
                    let (selector, d) = sig
                        .split_once(':')
                        .with_context(|| format!("expected selector:domain, got `{sig}`"))?;
                    Ok(DkimSignatureRef {
                        selector: selector.to_string(),
                        domain: domain(d)?,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            let request = AuthRequest {
                spf_domain,
                ip,
                helo: helo.as_deref().map(domain).transpose()?,
                sender,
                from_domain,
                dkim_signatures,
                pct_sample,
            };

            let verdict = auth.evaluate(&request).await;
            print(cli.json, &verdict, || {
                println!("Disposition: {}", verdict.disposition);
                println!("  SPF: {}", verdict.spf.result);
                for lookup in &verdict.dkim {
                    println!("  DKIM {}._domainkey.{}: {}", lookup.selector, lookup.domain, lookup.status.summary());
                }
                println!(
                    "  Aligned: spf={} dkim={}",
                    verdict.alignment.spf_aligned, verdict.alignment.dkim_aligned
                );
                println!("Trace:");
                for line in &verdict.trace {
                    println!("  {line}");
                }
            })?;
        }
    }

    Ok(())
}
