//! Route CRUD on top of `ip route`.

use crate::environ::{backticks, execute, tools};
use crate::link::get_if_data;
use crate::parse::parse_route_line;
use crate::types::Route;
use crate::{Error, Result};

/// Snapshot the main tables, IPv4 and IPv6.
pub fn get_route_data() -> Result<Vec<Route>> {
    let tools = tools()?;
    let (_, bynam) = get_if_data()?;
    let resolve = |name: &str| bynam.get(name).and_then(|a| a.index);

    let mut routes = Vec::new();
    for family in ["-4", "-6"] {
        let out = backticks(&[
            tools.ip.to_string_lossy().as_ref(),
            "-o",
            family,
            "route",
            "list",
        ])?;
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            if let Some(route) = parse_route_line(line, &resolve)? {
                routes.push(route);
            }
        }
    }
    Ok(routes)
}

fn route_cmd(verb: &str, route: &Route) -> Result<Vec<String>> {
    let tools = tools()?;
    let mut cmd = vec![
        tools.ip.to_string_lossy().into_owned(),
        String::from("route"),
        verb.to_owned(),
        route.kind.as_str().to_owned(),
    ];
    cmd.push(match route.prefix {
        Some(prefix) => format!("{prefix}/{}", route.prefix_len),
        None => String::from("default"),
    });
    if let Some(nexthop) = route.nexthop {
        cmd.push(String::from("via"));
        cmd.push(nexthop.to_string());
    }
    if let Some(index) = route.interface {
        let name = crate::link::get_if_by_index(index)?
            .name
            .ok_or_else(|| Error::NoSuchInterface(format!("#{index}")))?;
        cmd.push(String::from("dev"));
        cmd.push(name);
    }
    if route.metric != 0 {
        cmd.push(String::from("metric"));
        cmd.push(route.metric.to_string());
    }
    Ok(cmd)
}

pub fn add_route(route: &Route) -> Result<()> {
    execute(&route_cmd("add", route)?)
}

pub fn del_route(route: &Route) -> Result<()> {
    execute(&route_cmd("del", route)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RouteKind;

    #[test]
    fn default_route_command() {
        let r = Route::new(
            RouteKind::Unicast,
            None,
            0,
            Some("10.0.0.1".parse().unwrap()),
            None,
            0,
        )
        .unwrap();
        let cmd = route_cmd("add", &r).unwrap();
        assert!(cmd.join(" ").ends_with("route add unicast default via 10.0.0.1"));
    }

    #[test]
    fn metric_appended_when_nonzero() {
        let r = Route::new(
            RouteKind::Blackhole,
            Some("10.1.0.0".parse().unwrap()),
            16,
            None,
            None,
            5,
        )
        .unwrap();
        let cmd = route_cmd("del", &r).unwrap();
        assert!(cmd.join(" ").ends_with("route del blackhole 10.1.0.0/16 metric 5"));
    }

    #[test]
    fn v6_prefix_renders() {
        let r = Route::new(
            RouteKind::Unreachable,
            Some("fd00::".parse().unwrap()),
            8,
            None,
            None,
            0,
        )
        .unwrap();
        let cmd = route_cmd("add", &r).unwrap();
        assert!(cmd.join(" ").contains("unreachable fd00::/8"));
    }
}
