use crate::Value;

pub trait Visitable {
    fn visit_edges(&self, visitor: &mut impl Visitor);
}

pub trait Visitor: Sized {
    fn visit(&mut self, value: Value);
}

impl<F: FnMut(Value)> Visitor for F {
    #[inline]
    fn visit(&mut self, value: Value) {
        self(value)
    }
}

// visiting a value means we visit only its direct edges.
// the collector drives the transitive walk with its own worklist.
impl Visitable for [Value] {
    #[inline]
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        self.iter()
            .filter(|value| value.is_reference())
            .for_each(|&value| visitor.visit(value));
    }
}
