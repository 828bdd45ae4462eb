//! Qdisc trees for link emulation.
//!
//! Only four shapes are ever ours: no qdisc, a lone `tbf`, a lone
//! `netem`, or `tbf` at the root with `netem` as its child. Anything else
//! found on a managed port is *foreign* and is wiped before installing
//! our own tree. Transitions between recognised shapes are done with
//! in-place `tc qdisc change` edits where possible.

use tracing::warn;

use crate::environ::{backticks, execute, tools};
use crate::link::get_if_by_name;
use crate::parse::{Qdisc, parse_qdisc_line};
use crate::types::TcParams;
use crate::{Error, Result};

/// Handle given to the root qdisc we install.
const ROOT_HANDLE: &str = "1:";
/// Handle given to a netem child under a tbf root.
const CHILD_HANDLE: &str = "10:";

/// Classified qdisc state of one interface.
#[derive(Debug, Clone, PartialEq)]
pub enum QdiscTree {
    None,
    Tbf {
        handle: String,
        params: TcParams,
    },
    Netem {
        handle: String,
        params: TcParams,
    },
    TbfNetem {
        tbf_handle: String,
        netem_handle: String,
        params: TcParams,
    },
    /// Anything we did not install.
    Foreign,
}

impl QdiscTree {
    /// The emulation parameters the tree encodes (empty for none/foreign).
    pub fn params(&self) -> TcParams {
        match self {
            QdiscTree::None | QdiscTree::Foreign => TcParams::default(),
            QdiscTree::Tbf { params, .. }
            | QdiscTree::Netem { params, .. }
            | QdiscTree::TbfNetem { params, .. } => params.clone(),
        }
    }
}

/// Classify the qdisc dump of one interface.
///
/// Implicit kernel defaults (handle `0:`) are invisible: an interface
/// carrying only its default `pfifo_fast`/`noqueue` root counts as bare.
fn classify(qdiscs: &[Qdisc]) -> QdiscTree {
    let own: Vec<&Qdisc> = qdiscs.iter().filter(|q| q.handle != "0:").collect();
    match own.as_slice() {
        [] => QdiscTree::None,
        [q] if q.kind == "tbf" && q.parent.is_none() => QdiscTree::Tbf {
            handle: q.handle.clone(),
            params: q.params.clone(),
        },
        [q] if q.kind == "netem" && q.parent.is_none() => QdiscTree::Netem {
            handle: q.handle.clone(),
            params: q.params.clone(),
        },
        [a, b] => {
            let (tbf, netem) = if a.kind == "tbf" { (a, b) } else { (b, a) };
            if tbf.kind == "tbf"
                && tbf.parent.is_none()
                && netem.kind == "netem"
                && netem.parent.as_deref() == Some(tbf.handle.as_str())
            {
                let mut params = tbf.params.clone();
                let n = &netem.params;
                params.delay = n.delay;
                params.delay_jitter = n.delay_jitter;
                params.delay_correlation = n.delay_correlation;
                params.delay_distribution = n.delay_distribution.clone();
                params.loss = n.loss;
                params.loss_correlation = n.loss_correlation;
                params.dup = n.dup;
                params.dup_correlation = n.dup_correlation;
                params.corrupt = n.corrupt;
                params.corrupt_correlation = n.corrupt_correlation;
                QdiscTree::TbfNetem {
                    tbf_handle: tbf.handle.clone(),
                    netem_handle: netem.handle.clone(),
                    params,
                }
            } else {
                QdiscTree::Foreign
            }
        }
        _ => QdiscTree::Foreign,
    }
}

/// Read and classify the qdisc tree of `dev`.
pub fn get_tc_tree(dev: &str) -> Result<QdiscTree> {
    let tools = tools()?;
    let out = backticks(&[
        tools.tc.to_string_lossy().as_ref(),
        "qdisc",
        "show",
        "dev",
        dev,
    ])?;
    let mut qdiscs = Vec::new();
    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        if let Some(q) = parse_qdisc_line(line)? {
            qdiscs.push(q);
        }
    }
    Ok(classify(&qdiscs))
}

fn format_time(seconds: f64) -> String {
    format!("{}us", (seconds * 1e6).round() as u64)
}

fn format_percent(fraction: f64) -> String {
    format!("{:.3}%", fraction * 100.0)
}

/// tbf parameter list: rate as given, burst covering at least one tick of
/// traffic (never below the MTU), limit twice the burst.
fn tbf_args(params: &TcParams, mtu: u32, hz: u64) -> Result<Vec<String>> {
    let bandwidth = params
        .bandwidth
        .ok_or_else(|| Error::invalid("bandwidth", "missing for tbf"))?;
    let burst = std::cmp::max(u64::from(mtu), bandwidth / hz.max(1));
    Ok(vec![
        String::from("tbf"),
        String::from("rate"),
        format!("{bandwidth}bit"),
        String::from("burst"),
        burst.to_string(),
        String::from("limit"),
        (2 * burst).to_string(),
    ])
}

fn netem_args(params: &TcParams) -> Vec<String> {
    let mut args = vec![String::from("netem")];
    if let Some(delay) = params.delay {
        args.push(String::from("delay"));
        args.push(format_time(delay));
        if let Some(jitter) = params.delay_jitter {
            args.push(format_time(jitter));
            if let Some(corr) = params.delay_correlation {
                args.push(format_percent(corr));
            }
        }
        if let Some(dist) = &params.delay_distribution {
            args.push(String::from("distribution"));
            args.push(dist.clone());
        }
    }
    if let Some(loss) = params.loss {
        args.push(String::from("loss"));
        args.push(format_percent(loss));
        if let Some(corr) = params.loss_correlation {
            args.push(format_percent(corr));
        }
    }
    if let Some(dup) = params.dup {
        args.push(String::from("duplicate"));
        args.push(format_percent(dup));
        if let Some(corr) = params.dup_correlation {
            args.push(format_percent(corr));
        }
    }
    if let Some(corrupt) = params.corrupt {
        args.push(String::from("corrupt"));
        args.push(format_percent(corrupt));
        if let Some(corr) = params.corrupt_correlation {
            args.push(format_percent(corr));
        }
    }
    args
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    Add,
    Change,
}

impl Verb {
    fn as_str(self) -> &'static str {
        match self {
            Verb::Add => "add",
            Verb::Change => "change",
        }
    }
}

fn tc_cmd(dev: &str, verb: Verb, parent: Option<&str>, handle: &str, args: Vec<String>) -> Result<Vec<String>> {
    let tools = tools()?;
    let mut cmd = vec![
        tools.tc.to_string_lossy().into_owned(),
        String::from("qdisc"),
        verb.as_str().to_owned(),
        String::from("dev"),
        dev.to_owned(),
    ];
    match parent {
        Some(p) => {
            cmd.push(String::from("parent"));
            cmd.push(p.to_owned());
        }
        None => cmd.push(String::from("root")),
    }
    cmd.push(String::from("handle"));
    cmd.push(handle.to_owned());
    cmd.extend(args);
    Ok(cmd)
}

fn del_root(dev: &str) -> Result<()> {
    let tools = tools()?;
    execute(&[
        tools.tc.to_string_lossy().as_ref(),
        "qdisc",
        "del",
        "dev",
        dev,
        "root",
    ])
}

/// Install a tree from scratch on a bare interface.
fn install(dev: &str, mtu: u32, hz: u64, params: &TcParams) -> Result<()> {
    match (params.wants_tbf(), params.wants_netem()) {
        (false, false) => Ok(()),
        (true, false) => execute(&tc_cmd(dev, Verb::Add, None, ROOT_HANDLE, tbf_args(params, mtu, hz)?)?),
        (false, true) => execute(&tc_cmd(dev, Verb::Add, None, ROOT_HANDLE, netem_args(params))?),
        (true, true) => {
            execute(&tc_cmd(dev, Verb::Add, None, ROOT_HANDLE, tbf_args(params, mtu, hz)?)?)?;
            execute(&tc_cmd(
                dev,
                Verb::Add,
                Some(ROOT_HANDLE),
                CHILD_HANDLE,
                netem_args(params),
            )?)
        }
    }
}

/// Drive the qdisc tree of `dev` to encode exactly `params`.
///
/// Foreign configurations are wiped first. Where the current and target
/// shapes match, the qdiscs are edited in place instead of being torn
/// down and rebuilt, so traffic keeps flowing through the transition.
pub fn set_tc(dev: &str, params: &TcParams) -> Result<()> {
    params.validate()?;
    let tools = tools()?;
    let hz = tools.hz;
    let mtu = get_if_by_name(dev)?.mtu.unwrap_or(1500);

    let mut current = get_tc_tree(dev)?;
    if current == QdiscTree::Foreign {
        warn!(device = %dev, "foreign qdisc configuration, wiping");
        del_root(dev)?;
        current = QdiscTree::None;
    }
    let old = current.params();

    let result = apply_transition(dev, mtu, hz, &current, params);
    if let Err(e) = result {
        // Best-effort restore of the pre-call tree; the root may already
        // be gone.
        let _ = del_root(dev);
        if !old.is_empty() {
            if let Err(undo) = install(dev, mtu, hz, &old) {
                warn!(device = %dev, error = %undo, "tc rollback failed");
            }
        }
        return Err(e);
    }
    Ok(())
}

fn apply_transition(
    dev: &str,
    mtu: u32,
    hz: u64,
    current: &QdiscTree,
    params: &TcParams,
) -> Result<()> {
    let want = (params.wants_tbf(), params.wants_netem());
    match (current, want) {
        (QdiscTree::Foreign, _) => Err(Error::invalid("qdisc", "foreign tree not wiped")),

        (QdiscTree::None, _) => install(dev, mtu, hz, params),

        (QdiscTree::Tbf { .. }, (false, false))
        | (QdiscTree::Netem { .. }, (false, false))
        | (QdiscTree::TbfNetem { .. }, (false, false)) => del_root(dev),

        (QdiscTree::Tbf { handle, .. }, (true, false)) => execute(&tc_cmd(
            dev,
            Verb::Change,
            None,
            handle,
            tbf_args(params, mtu, hz)?,
        )?),
        (QdiscTree::Tbf { .. }, (false, true)) => {
            del_root(dev)?;
            install(dev, mtu, hz, params)
        }
        (QdiscTree::Tbf { handle, .. }, (true, true)) => {
            execute(&tc_cmd(
                dev,
                Verb::Change,
                None,
                handle,
                tbf_args(params, mtu, hz)?,
            )?)?;
            execute(&tc_cmd(
                dev,
                Verb::Add,
                Some(handle),
                CHILD_HANDLE,
                netem_args(params),
            )?)
        }

        (QdiscTree::Netem { handle, .. }, (false, true)) => execute(&tc_cmd(
            dev,
            Verb::Change,
            None,
            handle,
            netem_args(params),
        )?),
        (QdiscTree::Netem { .. }, _) => {
            del_root(dev)?;
            install(dev, mtu, hz, params)
        }

        (
            QdiscTree::TbfNetem {
                tbf_handle,
                netem_handle,
                ..
            },
            (true, true),
        ) => {
            execute(&tc_cmd(
                dev,
                Verb::Change,
                None,
                tbf_handle,
                tbf_args(params, mtu, hz)?,
            )?)?;
            execute(&tc_cmd(
                dev,
                Verb::Change,
                Some(tbf_handle),
                netem_handle,
                netem_args(params),
            )?)
        }
        (QdiscTree::TbfNetem { .. }, _) => {
            del_root(dev)?;
            install(dev, mtu, hz, params)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qdisc(kind: &str, handle: &str, parent: Option<&str>) -> Qdisc {
        Qdisc {
            kind: kind.to_owned(),
            handle: handle.to_owned(),
            parent: parent.map(str::to_owned),
            dev: None,
            params: TcParams::default(),
        }
    }

    #[test]
    fn classify_empty() {
        assert_eq!(classify(&[]), QdiscTree::None);
    }

    #[test]
    fn classify_ignores_kernel_default() {
        let qs = vec![qdisc("pfifo_fast", "0:", None)];
        assert_eq!(classify(&qs), QdiscTree::None);
        let qs = vec![qdisc("noqueue", "0:", None)];
        assert_eq!(classify(&qs), QdiscTree::None);
    }

    #[test]
    fn classify_lone_tbf() {
        let qs = vec![qdisc("tbf", "1:", None)];
        assert!(matches!(classify(&qs), QdiscTree::Tbf { .. }));
    }

    #[test]
    fn classify_lone_netem() {
        let qs = vec![qdisc("netem", "1:", None)];
        assert!(matches!(classify(&qs), QdiscTree::Netem { .. }));
    }

    #[test]
    fn classify_tbf_with_netem_child() {
        let qs = vec![qdisc("tbf", "1:", None), qdisc("netem", "10:", Some("1:"))];
        match classify(&qs) {
            QdiscTree::TbfNetem {
                tbf_handle,
                netem_handle,
                ..
            } => {
                assert_eq!(tbf_handle, "1:");
                assert_eq!(netem_handle, "10:");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_merges_params_from_both_levels() {
        let mut tbf = qdisc("tbf", "1:", None);
        tbf.params.bandwidth = Some(13_107_000);
        let mut netem = qdisc("netem", "10:", Some("1:"));
        netem.params.delay = Some(0.1);
        netem.params.loss = Some(0.05);
        match classify(&[tbf, netem]) {
            QdiscTree::TbfNetem { params, .. } => {
                assert_eq!(params.bandwidth, Some(13_107_000));
                assert_eq!(params.delay, Some(0.1));
                assert_eq!(params.loss, Some(0.05));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_foreign_kind() {
        let qs = vec![qdisc("prio", "8001:", None)];
        assert_eq!(classify(&qs), QdiscTree::Foreign);
    }

    #[test]
    fn classify_foreign_arrangement() {
        // netem root with tbf child is backwards
        let qs = vec![qdisc("netem", "1:", None), qdisc("tbf", "10:", Some("1:"))];
        assert_eq!(classify(&qs), QdiscTree::Foreign);
        // three qdiscs is never ours
        let qs = vec![
            qdisc("tbf", "1:", None),
            qdisc("netem", "10:", Some("1:")),
            qdisc("netem", "20:", Some("10:")),
        ];
        assert_eq!(classify(&qs), QdiscTree::Foreign);
    }

    #[test]
    fn classify_detached_netem_is_foreign() {
        let qs = vec![qdisc("tbf", "1:", None), qdisc("netem", "10:", Some("2:"))];
        assert_eq!(classify(&qs), QdiscTree::Foreign);
    }

    #[test]
    fn tbf_args_burst_floor_is_mtu() {
        let params = TcParams {
            bandwidth: Some(100_000),
            ..Default::default()
        };
        // 100kbit at HZ=100 is 1000 per tick, below the 1500 MTU
        let args = tbf_args(&params, 1500, 100).unwrap();
        assert_eq!(
            args.join(" "),
            "tbf rate 100000bit burst 1500 limit 3000"
        );
    }

    #[test]
    fn tbf_args_burst_scales_with_rate() {
        let params = TcParams {
            bandwidth: Some(13_107_200),
            ..Default::default()
        };
        let args = tbf_args(&params, 1500, 100).unwrap();
        assert_eq!(
            args.join(" "),
            "tbf rate 13107200bit burst 131072 limit 262144"
        );
    }

    #[test]
    fn netem_args_full_set() {
        let params = TcParams {
            delay: Some(0.1),
            delay_jitter: Some(0.01),
            delay_correlation: Some(0.25),
            loss: Some(0.1),
            loss_correlation: Some(0.25),
            dup: Some(0.05),
            corrupt: Some(0.01),
            ..Default::default()
        };
        assert_eq!(
            netem_args(&params).join(" "),
            "netem delay 100000us 10000us 25.000% loss 10.000% 25.000% duplicate 5.000% corrupt 1.000%"
        );
    }

    #[test]
    fn netem_args_distribution() {
        let params = TcParams {
            delay: Some(0.05),
            delay_jitter: Some(0.01),
            delay_distribution: Some(String::from("normal")),
            ..Default::default()
        };
        assert_eq!(
            netem_args(&params).join(" "),
            "netem delay 50000us 10000us distribution normal"
        );
    }

    #[test]
    fn percent_formatting() {
        assert_eq!(format_percent(0.1), "10.000%");
        assert_eq!(format_percent(0.12345), "12.345%");
        assert_eq!(format_percent(1.0), "100.000%");
    }

    #[test]
    fn time_formatting() {
        assert_eq!(format_time(0.1), "100000us");
        assert_eq!(format_time(0.000001), "1us");
    }

    #[test]
    fn tree_params_accessor() {
        assert!(QdiscTree::None.params().is_empty());
        assert!(QdiscTree::Foreign.params().is_empty());
    }
}
