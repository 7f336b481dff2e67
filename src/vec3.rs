// Copyright (c) Facebook, Inc. and its affiliates
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::value::Value;
use std::ops::{Add, Mul, Sub};

/// A 3-vector of scalar nodes.
///
/// This is a thin aggregate: every vector operation expands into the scalar
/// operators of [`Value`], so the result participates in backward passes and
/// kernel compilation like any other scalar expression.
#[derive(Clone, Debug)]
pub struct Vec3 {
    pub x: Value,
    pub y: Value,
    pub z: Value,
}

impl Vec3 {
    pub fn new(x: Value, y: Value, z: Value) -> Self {
        Vec3 { x, y, z }
    }

    /// A vector of non-differentiable components.
    pub fn constant(x: f64, y: f64, z: f64) -> Self {
        Vec3::new(Value::constant(x), Value::constant(y), Value::constant(z))
    }

    /// A vector of differentiable components.
    pub fn variable(x: f64, y: f64, z: f64) -> Self {
        Vec3::new(Value::variable(x), Value::variable(y), Value::variable(z))
    }

    /// The current component values.
    pub fn data(&self) -> [f64; 3] {
        [self.x.data(), self.y.data(), self.z.data()]
    }

    pub fn dot(&self, other: &Vec3) -> Value {
        &(&self.x * &other.x) + &(&(&self.y * &other.y) + &(&self.z * &other.z))
    }

    pub fn cross(&self, other: &Vec3) -> Vec3 {
        Vec3::new(
            &(&self.y * &other.z) - &(&self.z * &other.y),
            &(&self.z * &other.x) - &(&self.x * &other.z),
            &(&self.x * &other.y) - &(&self.y * &other.x),
        )
    }

    pub fn length_squared(&self) -> Value {
        self.dot(self)
    }

    pub fn magnitude(&self) -> Value {
        self.length_squared().sqrt()
    }

    /// Unit vector in the direction of `self`. Degenerate (zero-length)
    /// vectors produce non-finite components, which the solvers treat as a
    /// rejection signal.
    pub fn normalized(&self) -> Vec3 {
        let len = self.magnitude();
        Vec3::new(&self.x / &len, &self.y / &len, &self.z / &len)
    }

    /// Scale by a scalar node.
    pub fn scale(&self, s: &Value) -> Vec3 {
        Vec3::new(&self.x * s, &self.y * s, &self.z * s)
    }

    /// Euclidean distance between two points.
    pub fn distance(a: &Vec3, b: &Vec3) -> Value {
        (a - b).magnitude()
    }
}

impl Add for &Vec3 {
    type Output = Vec3;
    fn add(self, rhs: &Vec3) -> Vec3 {
        Vec3::new(&self.x + &rhs.x, &self.y + &rhs.y, &self.z + &rhs.z)
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        &self + &rhs
    }
}

impl Sub for &Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: &Vec3) -> Vec3 {
        Vec3::new(&self.x - &rhs.x, &self.y - &rhs.y, &self.z - &rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        &self - &rhs
    }
}

impl Mul<f64> for &Vec3 {
    type Output = Vec3;
    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(&self.x * rhs, &self.y * rhs, &self.z * rhs)
    }
}

impl Mul<&Vec3> for f64 {
    type Output = Vec3;
    fn mul(self, rhs: &Vec3) -> Vec3 {
        rhs * self
    }
}

impl Mul<&Value> for &Vec3 {
    type Output = Vec3;
    fn mul(self, rhs: &Value) -> Vec3 {
        self.scale(rhs)
    }
}
