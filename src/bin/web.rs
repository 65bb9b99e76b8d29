use actix_web::{App, HttpResponse, HttpServer, Responder, web};
use env_logger::Env;
use mailauth_engine::domain::DomainName;
use mailauth_engine::{AuthRequest, Authenticator, DkimSignatureRef, DnsResolver, EngineConfig, SpfRequest};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;

type Engine = web::Data<Authenticator<DnsResolver>>;

#[derive(Deserialize)]
struct SpfQuery {
    domain: Option<String>,
    ip: Option<String>,
    helo: Option<String>,
    sender: Option<String>,
}

#[derive(Deserialize)]
struct DkimQuery {
    domain: Option<String>,
    selector: Option<String>,
}

#[derive(Deserialize)]
struct DomainQuery {
    domain: Option<String>,
}

#[derive(Deserialize)]
struct SignatureBody {
    selector: String,
    domain: String,
}

#[derive(Deserialize)]
struct EvaluateBody {
    from_domain: String,
    ip: String,
    /// MAIL FROM domain; defaults to `from_domain`
    spf_domain: Option<String>,
    helo: Option<String>,
    sender: Option<String>,
    #[serde(default)]
    dkim: Vec<SignatureBody>,
    pct_sample: Option<u8>,
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({ "error": message }))
}

fn required<'a>(value: &'a Option<String>, param: &str) -> Result<&'a str, HttpResponse> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(bad_request(format!("missing `{param}` parameter"))),
    }
}

fn domain(value: &str) -> Result<DomainName, HttpResponse> {
    DomainName::parse(value).map_err(|e| bad_request(format!("invalid domain `{value}`: {e}")))
}

fn ip(value: &str) -> Result<IpAddr, HttpResponse> {
    value
        .parse()
        .map_err(|_| bad_request(format!("invalid IP address `{value}`")))
}

fn optional_domain(value: &Option<String>) -> Result<Option<DomainName>, HttpResponse> {
    value.as_deref().map(domain).transpose()
}

fn spf_request(query: &SpfQuery) -> Result<SpfRequest, HttpResponse> {
    let d = domain(required(&query.domain, "domain")?)?;
    let addr = ip(required(&query.ip, "ip")?)?;
    Ok(SpfRequest::new(d, addr)
        .with_helo(optional_domain(&query.helo)?)
        .with_sender(query.sender.clone()))
}

async fn spf(engine: Engine, query: web::Query<SpfQuery>) -> impl Responder {
    match spf_request(&query) {
        Ok(request) => HttpResponse::Ok().json(engine.check_spf(&request).await),
        Err(response) => response,
    }
}

async fn dkim(engine: Engine, query: web::Query<DkimQuery>) -> impl Responder {
    let d = match required(&query.domain, "domain").and_then(domain) {
        Ok(d) => d,
        Err(response) => return response,
    };
    match query.selector.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(selector) => HttpResponse::Ok().json(engine.check_dkim(selector, &d).await),
        None => HttpResponse::Ok().json(engine.probe_dkim(&d).await),
    }
}

async fn dmarc(engine: Engine, query: web::Query<DomainQuery>) -> impl Responder {
    match required(&query.domain, "domain").and_then(domain) {
        Ok(d) => HttpResponse::Ok().json(engine.check_dmarc(&d).await),
        Err(response) => response,
    }
}

fn auth_request(body: &EvaluateBody) -> Result<AuthRequest, HttpResponse> {
    let from_domain = domain(&body.from_domain)?;
    let spf_domain = optional_domain(&body.spf_domain)?.unwrap_or_else(|| from_domain.clone());
    let dkim_signatures = body
        .dkim
        .iter()
        .map(|sig| {
            Ok(DkimSignatureRef {
                selector: sig.selector.clone(),
                domain: domain(&sig.domain)?,
            })
        })
        .collect::<Result<Vec<_>, HttpResponse>>()?;
    if body.pct_sample.is_some_and(|s| s >= 100) {
        return Err(bad_request("pct_sample must be below 100".to_string()));
    }

    Ok(AuthRequest {
        spf_domain,
        ip: ip(&body.ip)?,
        helo: optional_domain(&body.helo)?,
        sender: body.sender.clone(),
        from_domain,
        dkim_signatures,
        pct_sample: body.pct_sample,
    })
}

async fn evaluate(engine: Engine, body: web::Json<EvaluateBody>) -> impl Responder {
    match auth_request(&body) {
        Ok(request) => HttpResponse::Ok().json(engine.evaluate(&request).await),
        Err(response) => response,
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    log::info!("Starting mail authentication service");

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let config = EngineConfig::from_env().map_err(std::io::Error::other)?;
    let engine = Authenticator::from_config(&config).map_err(std::io::Error::other)?;
    let engine = web::Data::new(engine);

    log::info!("Binding to {}:{} (nameservers {:?})", host, port, config.nameservers);

    HttpServer::new(move || {
        App::new()
            .app_data(engine.clone())
            .route("/spf", web::get().to(spf))
            .route("/dkim", web::get().to(dkim))
            .route("/dmarc", web::get().to(dmarc))
            .route("/evaluate", web::post().to(evaluate))
            .wrap(actix_web::middleware::Logger::default())
    })
        .workers(num_cpus::get())
        .keep_alive(std::time::Duration::from_secs(75))
        .max_connections(1_000)
        .bind((host.as_str(), port))?
        .run()
        .await
}
