//! Typed ID definitions for compute resources.

use crate::define_id;

define_id!(InstanceId, "i");
define_id!(SecurityGroupId, "sg");
