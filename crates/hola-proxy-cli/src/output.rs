//! Output for the list modes.

use hola_proxy::hola::api::TunnelList;
use hola_proxy::Credentials;
use std::io::Write;

/// Port-map fields shown as columns, in order.
const PORT_COLUMNS: &[&str] = &["direct", "peer", "hola", "trial", "trial_peer"];

/// One country code per line.
pub fn write_countries<W: Write>(out: &mut W, countries: &[String]) -> std::io::Result<()> {
    for country in countries {
        writeln!(out, "{}", country)?;
    }
    out.flush()
}

/// Credentials header, a blank line, then one CSV row per agent.
///
/// Ports the control plane did not offer are printed as `0`.
pub fn write_proxy_list<W: Write>(
    out: &mut W,
    credentials: &Credentials,
    list: &TunnelList,
) -> std::io::Result<()> {
    writeln!(out, "Login: {}", credentials.login())?;
    writeln!(out, "Password: {}", credentials.password())?;
    writeln!(
        out,
        "Proxy-Authorization: {}",
        &*credentials.proxy_authorization()
    )?;
    writeln!(out)?;

    writeln!(out, "host,ip_address,{},vendor", PORT_COLUMNS.join(","))?;
    for agent in &list.agents {
        let ports: Vec<String> = PORT_COLUMNS
            .iter()
            .map(|field| list.port(field).unwrap_or(0).to_string())
            .collect();
        writeln!(
            out,
            "{},{},{},{}",
            agent.host,
            agent.ip,
            ports.join(","),
            agent.vendor.as_deref().unwrap_or("")
        )?;
    }
    out.flush()
}
