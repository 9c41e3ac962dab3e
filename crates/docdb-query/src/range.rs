use bson::Bson;

use crate::error::{Error, Result};

/// Operand of the internal `$range` operator.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeParams {
    pub min: Bson,
    pub max: Bson,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
    pub full_scan: bool,
    /// Direction requested through `orderByScan`, if any.
    pub order_scan_direction: Option<i32>,
}

impl Default for RangeParams {
    fn default() -> Self {
        RangeParams {
            min: Bson::MinKey,
            max: Bson::MaxKey,
            min_inclusive: false,
            max_inclusive: false,
            full_scan: false,
            order_scan_direction: None,
        }
    }
}

impl RangeParams {
    pub fn parse(value: &Bson) -> Result<RangeParams> {
        let Bson::Document(doc) = value else {
            return Err(Error::bad_value("$range needs a document"));
        };
        let mut params = RangeParams::default();
        for (key, v) in doc {
            match key.as_str() {
                "min" => params.min = v.clone(),
                "max" => params.max = v.clone(),
                "minInclusive" => params.min_inclusive = matches!(v, Bson::Boolean(true)),
                "maxInclusive" => params.max_inclusive = matches!(v, Bson::Boolean(true)),
                "fullScan" => params.full_scan = true,
                "orderByScan" => {
                    params.full_scan = true;
                    params.order_scan_direction = Some(match v {
                        Bson::Int32(n) => *n,
                        Bson::Int64(n) => *n as i32,
                        Bson::Double(f) => *f as i32,
                        _ => 1,
                    });
                }
                other => {
                    return Err(Error::bad_value(format!(
                        "Range predicate not supported: {other}"
                    )));
                }
            }
        }
        if params.full_scan {
            params.min = Bson::MinKey;
            params.max = Bson::MaxKey;
            params.min_inclusive = true;
            params.max_inclusive = true;
        }
        Ok(params)
    }
}
