//! JSON <-> QuickJS value conversion
//!
//! Call arguments arrive as JSON and return values leave as JSON, so only
//! JSON-expressible values survive the boundary. Functions, symbols and
//! non-finite numbers collapse to `null`, matching `JSON.stringify`.

use rquickjs::{Array, Ctx, IntoJs, Object, Value};

pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    Ok(match value {
        serde_json::Value::Null => Value::new_null(ctx.clone()),
        serde_json::Value::Bool(b) => Value::new_bool(ctx.clone(), *b),
        serde_json::Value::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
            Some(small) => Value::new_int(ctx.clone(), small),
            None => Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => s.as_str().into_js(ctx)?,
        serde_json::Value::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                array.set(i, json_to_js(ctx, item)?)?;
            }
            array.into_value()
        }
        serde_json::Value::Object(entries) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in entries {
                object.set(key.as_str(), json_to_js(ctx, item)?)?;
            }
            object.into_value()
        }
    })
}

pub fn js_to_json(value: &Value<'_>) -> serde_json::Value {
    if value.is_undefined() || value.is_null() {
        return serde_json::Value::Null;
    }
    if let Some(b) = value.as_bool() {
        return serde_json::Value::Bool(b);
    }
    if let Some(i) = value.as_int() {
        return serde_json::Value::from(i);
    }
    if let Some(f) = value.as_float() {
        // Integral floats print as integers, like JSON.stringify
        if f.is_finite() && f.fract() == 0.0 && (i64::MIN as f64..=i64::MAX as f64).contains(&f) {
            return serde_json::Value::from(f as i64);
        }
        return serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null);
    }
    if let Some(s) = value.as_string() {
        return match s.to_string() {
            Ok(s) => serde_json::Value::String(s),
            Err(_) => serde_json::Value::Null,
        };
    }
    if value.is_function() {
        return serde_json::Value::Null;
    }
    if let Some(array) = value.as_array() {
        let items = array
            .iter::<Value>()
            .map(|item| {
                item.map(|v| js_to_json(&v))
                    .unwrap_or(serde_json::Value::Null)
            })
            .collect();
        return serde_json::Value::Array(items);
    }
    if let Some(object) = value.as_object() {
        let mut map = serde_json::Map::new();
        for prop in object.props::<String, Value>().flatten() {
            let (key, item) = prop;
            map.insert(key, js_to_json(&item));
        }
        return serde_json::Value::Object(map);
    }
    serde_json::Value::Null
}
