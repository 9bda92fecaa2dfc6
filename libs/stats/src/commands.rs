//! Control-channel command handlers for statistics.
//!
//! Each handler takes the command arguments and produces the standard
//! response envelope `{"result": 0|1, "text": …, "arguments": …}`.
use serde_json::{Value, json};

use crate::StatsMgr;

/// command completed
pub const RESULT_SUCCESS: i64 = 0;
/// command failed
pub const RESULT_ERROR: i64 = 1;

fn answer(result: i64, text: &str) -> Value {
    json!({ "result": result, "text": text })
}

fn answer_with(result: i64, text: &str, arguments: Value) -> Value {
    json!({ "result": result, "text": text, "arguments": arguments })
}

/// extract the mandatory "name" argument common to the non-`-all`
/// commands
fn name_param(params: Option<&Value>) -> Result<&str, Value> {
    let params = params.ok_or_else(|| {
        answer(RESULT_ERROR, "Missing mandatory 'name' parameter.")
    })?;
    let name = params.get("name").ok_or_else(|| {
        answer(RESULT_ERROR, "Missing mandatory 'name' parameter.")
    })?;
    name.as_str()
        .ok_or_else(|| answer(RESULT_ERROR, "'name' parameter expected to be a string."))
}

/// dispatch one statistics command by name. Unknown commands produce an
/// error envelope rather than a transport failure.
pub fn dispatch(mgr: &StatsMgr, command: &str, params: Option<&Value>) -> Value {
    match command {
        "statistic-get" => statistic_get(mgr, params),
        "statistic-reset" => statistic_reset(mgr, params),
        "statistic-remove" => statistic_remove(mgr, params),
        "statistic-get-all" => statistic_get_all(mgr),
        "statistic-reset-all" => statistic_reset_all(mgr),
        "statistic-remove-all" => statistic_remove_all(mgr),
        other => answer(RESULT_ERROR, &format!("unknown command '{other}'")),
    }
}

pub fn statistic_get(mgr: &StatsMgr, params: Option<&Value>) -> Value {
    match name_param(params) {
        Ok(name) => answer_with(RESULT_SUCCESS, "", mgr.get(name)),
        Err(resp) => resp,
    }
}

pub fn statistic_reset(mgr: &StatsMgr, params: Option<&Value>) -> Value {
    match name_param(params) {
        Ok(name) if mgr.reset(name) => {
            answer(RESULT_SUCCESS, &format!("Statistic '{name}' reset."))
        }
        Ok(name) => answer(RESULT_ERROR, &format!("No '{name}' statistic found")),
        Err(resp) => resp,
    }
}

pub fn statistic_remove(mgr: &StatsMgr, params: Option<&Value>) -> Value {
    match name_param(params) {
        Ok(name) if mgr.del(name) => {
            answer(RESULT_SUCCESS, &format!("Statistic '{name}' removed."))
        }
        Ok(name) => answer(RESULT_ERROR, &format!("No '{name}' statistic found")),
        Err(resp) => resp,
    }
}

pub fn statistic_get_all(mgr: &StatsMgr) -> Value {
    answer_with(RESULT_SUCCESS, "", mgr.get_all())
}

pub fn statistic_reset_all(mgr: &StatsMgr) -> Value {
    mgr.reset_all();
    answer(RESULT_SUCCESS, "All statistics reset to neutral values.")
}

pub fn statistic_remove_all(mgr: &StatsMgr) -> Value {
    mgr.remove_all();
    answer(RESULT_SUCCESS, "All statistics removed.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_requires_name() {
        let mgr = StatsMgr::new();
        let resp = dispatch(&mgr, "statistic-get", None);
        assert_eq!(resp["result"], RESULT_ERROR);

        let resp = dispatch(&mgr, "statistic-get", Some(&json!({"name": 7})));
        assert_eq!(resp["result"], RESULT_ERROR);
    }

    #[test]
    fn get_round_trip() {
        let mgr = StatsMgr::new();
        mgr.set_value("pkt4-received", 3u64).unwrap();
        let resp = dispatch(&mgr, "statistic-get", Some(&json!({"name": "pkt4-received"})));
        assert_eq!(resp["result"], RESULT_SUCCESS);
        assert_eq!(resp["arguments"]["pkt4-received"][0][0], 3);
    }

    #[test]
    fn reset_and_remove_report_missing_names() {
        let mgr = StatsMgr::new();
        let resp = dispatch(&mgr, "statistic-reset", Some(&json!({"name": "nope"})));
        assert_eq!(resp["result"], RESULT_ERROR);

        mgr.set_value("x", 1u64).unwrap();
        let resp = dispatch(&mgr, "statistic-remove", Some(&json!({"name": "x"})));
        assert_eq!(resp["result"], RESULT_SUCCESS);
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn all_variants_take_no_name() {
        let mgr = StatsMgr::new();
        mgr.set_value("a", 1u64).unwrap();
        mgr.set_value("b", 2u64).unwrap();

        let resp = dispatch(&mgr, "statistic-get-all", None);
        assert_eq!(resp["result"], RESULT_SUCCESS);
        assert!(resp["arguments"].get("a").is_some());

        let resp = dispatch(&mgr, "statistic-reset-all", None);
        assert_eq!(resp["result"], RESULT_SUCCESS);
        assert_eq!(mgr.get_integer("b"), 0);

        let resp = dispatch(&mgr, "statistic-remove-all", None);
        assert_eq!(resp["result"], RESULT_SUCCESS);
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn unknown_command_is_an_error_envelope() {
        let mgr = StatsMgr::new();
        let resp = dispatch(&mgr, "statistic-frobnicate", None);
        assert_eq!(resp["result"], RESULT_ERROR);
    }
}
