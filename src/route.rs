//! Destination-side state of an agreed map: the compiled expression and
//! the most recent input from each source, per destination instance.

use hashbrown::HashMap;

use crate::expr::{self, Program};
use crate::instance::InstanceId;
use crate::model::{MapId, MapRecord, SignalId, Type, Value};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Route {
    map: MapId,
    sources: Vec<SignalId>,
    program: Option<Program>,
    use_instances: bool,
    inputs: HashMap<InstanceId, Vec<Option<Value>>>,
}

impl Route {
    pub fn new(map: &MapRecord) -> Result<Self> {
        let mut route = Self {
            map: map.id(),
            sources: map.sources().to_vec(),
            program: None,
            use_instances: map.use_instances(),
            inputs: HashMap::new(),
        };
        route.recompile(map.expression())?;
        Ok(route)
    }

    pub fn map(&self) -> MapId {
        self.map
    }

    /// Replace the compiled expression. On error the previous program stays.
    pub fn recompile(&mut self, expression: Option<&str>) -> Result<()> {
        self.program = match expression {
            Some(text) => Some(expr::compile(text, self.sources.len()).map_err(|e| Error::InvalidMapSpec(e.to_string()))?),
            None => None,
        };
        Ok(())
    }

    /// Destination instance receiving traffic from a source instance.
    pub fn target_instance(&self, source_instance: InstanceId) -> InstanceId {
        if self.use_instances { source_instance } else { 0 }
    }

    pub fn use_instances(&self) -> bool {
        self.use_instances
    }

    /// Record a source value and, once every source has reported for the
    /// target instance, compute the destination value.
    pub fn feed(
        &mut self,
        source: SignalId,
        instance: InstanceId,
        value: &Value,
        dst_type: Type,
        dst_len: usize,
    ) -> Result<Option<Value>> {
        let Some(program) = &self.program else {
            let out = value.coerce(dst_type)?;
            return fit_identity(out, dst_len).map(Some);
        };
        let slot = self.sources.iter().position(|s| *s == source).ok_or_else(|| {
            Error::InvalidMapSpec(format!("signal {source} is not a source of map {}", self.map))
        })?;
        let target = if self.use_instances { instance } else { 0 };
        let n = self.sources.len();
        let inputs = self.inputs.entry(target).or_insert_with(|| vec![None; n]);
        inputs[slot] = Some(value.clone());

        let mut vectors = Vec::with_capacity(n);
        for input in inputs.iter() {
            let Some(v) = input else { return Ok(None) };
            let items = v.to_f64_vec().ok_or_else(|| Error::TypeMismatch {
                expected: "numeric source value".into(),
                got: v.type_name().into(),
            })?;
            vectors.push(items);
        }
        let slices: Vec<&[f64]> = vectors.iter().map(Vec::as_slice).collect();
        let result = program.eval(&slices)?;
        Value::from_f64s(dst_type, &fit(result, dst_len)?).map(Some)
    }

    /// Forget the inputs cached for a destination instance.
    pub fn release(&mut self, target: InstanceId) {
        self.inputs.remove(&target);
    }
}

fn fit(mut items: Vec<f64>, len: usize) -> Result<Vec<f64>> {
    match items.len() {
        n if n == len => Ok(items),
        1 => Ok(vec![items[0]; len]),
        n if n > len => {
            items.truncate(len);
            Ok(items)
        }
        n => Err(Error::TypeMismatch { expected: format!("{len} elements"), got: format!("{n} elements") }),
    }
}

fn fit_identity(value: Value, len: usize) -> Result<Value> {
    if value.len() != len {
        return Err(Error::TypeMismatch { expected: format!("{len} elements"), got: format!("{} elements", value.len()) });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphId, Object, Prop};

    fn sig(dev: u64, n: u64) -> SignalId {
        SignalId((dev << 32) | n)
    }

    fn record(sources: Vec<SignalId>, expr: Option<&str>) -> MapRecord {
        MapRecord::new(sources, sig(9, 1), expr, true, GraphId(1))
    }

    #[test]
    fn test_scaled_route() {
        let mut route = Route::new(&record(vec![sig(1, 1)], Some("y=x$0*1000"))).unwrap();
        let out = route.feed(sig(1, 1), 3, &Value::from(0.1f32), Type::Float, 1).unwrap();
        let Some(Value::Float(v)) = out else { panic!("expected float output") };
        assert!((v[0] - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_convergent_waits_for_all_sources() {
        let mut route = Route::new(&record(vec![sig(1, 1), sig(2, 1)], Some("y=x$0+x$1"))).unwrap();
        assert_eq!(route.feed(sig(1, 1), 0, &Value::from(1i32), Type::Int32, 1).unwrap(), None);
        assert_eq!(route.feed(sig(2, 1), 0, &Value::from(2i32), Type::Int32, 1).unwrap(), Some(Value::from(3i32)));
        route.release(0);
        assert_eq!(route.feed(sig(2, 1), 0, &Value::from(2i32), Type::Int32, 1).unwrap(), None);
    }

    #[test]
    fn test_identity_coerces_type() {
        let mut route = Route::new(&record(vec![sig(1, 1)], None)).unwrap();
        let out = route.feed(sig(1, 1), 0, &Value::from(vec![1.4f32, 2.6]), Type::Int32, 2).unwrap();
        assert_eq!(out, Some(Value::from(vec![1i32, 3])));
        assert!(route.feed(sig(1, 1), 0, &Value::from(1.0f32), Type::Int32, 2).is_err());
    }

    #[test]
    fn test_scalar_result_broadcasts() {
        let mut route = Route::new(&record(vec![sig(1, 1)], Some("y=1"))).unwrap();
        let out = route.feed(sig(1, 1), 0, &Value::from(5.0f64), Type::Double, 3).unwrap();
        assert_eq!(out, Some(Value::from(vec![1.0f64, 1.0, 1.0])));
    }

    #[test]
    fn test_instance_mapping() {
        let mut map = record(vec![sig(1, 1)], None);
        assert_eq!(Route::new(&map).unwrap().target_instance(7), 0);
        map.set_use_instances(true);
        assert_eq!(Route::new(&map).unwrap().target_instance(7), 7);
        assert!(map.props().get(Prop::UseInstances).is_some());
    }

    #[test]
    fn test_bad_recompile_keeps_program() {
        let mut route = Route::new(&record(vec![sig(1, 1)], Some("y=x*2"))).unwrap();
        assert!(matches!(route.recompile(Some("y=x$4")), Err(Error::InvalidMapSpec(_))));
        let out = route.feed(sig(1, 1), 0, &Value::from(2.0f64), Type::Double, 1).unwrap();
        assert_eq!(out, Some(Value::from(4.0f64)));
    }
}
