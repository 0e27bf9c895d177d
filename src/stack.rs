//! Stack module: the framed operand stack.
//!
//! Values live in one flat vector. A frame is a contiguous window over it holding one value per
//! context item, so a single opcode evaluates a predicate for every candidate node at once.

use crate::types::Value;
use crate::{Result, WirequeryError};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrame {
    pub base: usize,
    pub end: usize,
}

impl StackFrame {
    pub fn count(&self) -> usize {
        self.end - self.base
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.base
    }

    pub fn range(&self) -> Range<usize> {
        self.base..self.end
    }
}

#[derive(Debug, Clone)]
pub struct EvalStack {
    values: Vec<Value>,
    frames: Vec<StackFrame>,
    max_depth: usize,
}

impl EvalStack {
    pub fn new(max_depth: usize) -> Self {
        Self { values: Vec::new(), frames: Vec::new(), max_depth }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.frames.clear();
    }

    /// Opens an empty frame on top of the stack.
    pub fn push_frame(&mut self) -> Result<()> {
        if self.frames.len() >= self.max_depth {
            return Err(WirequeryError::Unexpected(format!("stack depth limit {} exceeded", self.max_depth)));
        }
        let base = self.values.len();
        self.frames.push(StackFrame { base, end: base });
        Ok(())
    }

    /// Appends a value to the top frame.
    pub fn push(&mut self, value: Value) -> Result<()> {
        let frame = self.frames.last_mut().ok_or_else(|| WirequeryError::Unexpected("push without a frame".into()))?;
        self.values.push(value);
        frame.end += 1;
        Ok(())
    }

    pub fn top_frame(&self) -> Result<StackFrame> {
        self.frames.last().copied().ok_or_else(|| WirequeryError::Unexpected("stack underflow".into()))
    }

    /// The frame directly below the top frame.
    pub fn secondary_frame(&self) -> Result<StackFrame> {
        let len = self.frames.len();
        if len < 2 {
            return Err(WirequeryError::Unexpected("stack underflow".into()));
        }
        Ok(self.frames[len - 2])
    }

    /// The `n`th frame from the top, zero being the top frame.
    pub fn frame_at(&self, n: usize) -> Result<StackFrame> {
        let len = self.frames.len();
        if n >= len {
            return Err(WirequeryError::Unexpected("stack underflow".into()));
        }
        Ok(self.frames[len - 1 - n])
    }

    pub fn values(&self, frame: StackFrame) -> &[Value] {
        &self.values[frame.range()]
    }

    pub fn values_mut(&mut self, frame: StackFrame) -> &mut [Value] {
        &mut self.values[frame.range()]
    }

    pub fn value(&self, index: usize) -> &Value {
        &self.values[index]
    }

    pub fn replace(&mut self, index: usize, value: Value) -> Value {
        std::mem::replace(&mut self.values[index], value)
    }

    /// Pops the top frame, handing each removed value to `release`.
    pub fn pop_frame_with(&mut self, mut release: impl FnMut(Value)) -> Result<()> {
        let frame = self.frames.pop().ok_or_else(|| WirequeryError::Unexpected("stack underflow".into()))?;
        for value in self.values.drain(frame.base..) {
            release(value);
        }
        Ok(())
    }

    /// Copies the stack into caller-owned buffers, cloning each value through `copy`.
    pub fn copy_into(
        &self,
        values: &mut Vec<Value>,
        frames: &mut Vec<StackFrame>,
        copy: impl FnMut(&Value) -> Value,
    ) {
        values.clear();
        values.extend(self.values.iter().map(copy));
        frames.clear();
        frames.extend_from_slice(&self.frames);
    }

    /// Exchanges the stack contents with buffers filled by `copy_into`.
    pub fn swap_parts(&mut self, values: &mut Vec<Value>, frames: &mut Vec<StackFrame>) {
        std::mem::swap(&mut self.values, values);
        std::mem::swap(&mut self.frames, frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_partition_values() {
        let mut stack = EvalStack::new(8);
        stack.push_frame().unwrap();
        stack.push(Value::Double(1.0)).unwrap();
        stack.push(Value::Double(2.0)).unwrap();
        stack.push_frame().unwrap();
        stack.push(Value::Boolean(true)).unwrap();

        let top = stack.top_frame().unwrap();
        let below = stack.secondary_frame().unwrap();
        assert_eq!(top.count(), 1);
        assert_eq!(below.count(), 2);
        assert_eq!(stack.values(below), &[Value::Double(1.0), Value::Double(2.0)]);
        assert_eq!(stack.frame_at(1).unwrap(), below);
    }

    #[test]
    fn test_pop_frame_releases_values() {
        let mut stack = EvalStack::new(8);
        stack.push_frame().unwrap();
        stack.push(Value::from("a")).unwrap();
        stack.push(Value::from("b")).unwrap();
        let mut released = Vec::new();
        stack.pop_frame_with(|v| released.push(v)).unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.value_count(), 0);
    }

    #[test]
    fn test_underflow_and_overflow_are_unexpected() {
        let mut stack = EvalStack::new(1);
        assert!(matches!(stack.top_frame(), Err(WirequeryError::Unexpected(_))));
        assert!(matches!(stack.push(Value::Boolean(true)), Err(WirequeryError::Unexpected(_))));
        stack.push_frame().unwrap();
        assert!(matches!(stack.push_frame(), Err(WirequeryError::Unexpected(_))));
        assert!(stack.secondary_frame().is_err());
    }

    #[test]
    fn test_copy_and_swap_parts() {
        let mut stack = EvalStack::new(4);
        stack.push_frame().unwrap();
        stack.push(Value::Double(3.0)).unwrap();
        let mut values = vec![Value::Boolean(true)];
        let mut frames = Vec::new();
        stack.copy_into(&mut values, &mut frames, |v| v.clone());
        assert_eq!(values, vec![Value::Double(3.0)]);

        stack.clear();
        stack.push_frame().unwrap();
        stack.push(Value::from("later")).unwrap();
        stack.swap_parts(&mut values, &mut frames);
        assert_eq!(stack.values(stack.top_frame().unwrap()), &[Value::Double(3.0)]);
        assert_eq!(values, vec![Value::from("later")]);
        assert_eq!(frames.len(), 1);
    }
}
