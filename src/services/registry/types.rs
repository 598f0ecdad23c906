use rand::Rng;
use std::collections::HashMap;

use crate::config::{RegistryConfig, RpcConfig};
use crate::services::backend::{Instance, InstanceRegistration};

/// 按权重随机选出一个实例，权重全为 0 时取第一个
pub fn select_weighted(instances: &[Instance]) -> Option<&Instance> {
    if instances.is_empty() {
        return None;
    }

    let total: f64 = instances.iter().map(|i| i.weight.max(0.0)).sum();
    if total <= 0.0 {
        return instances.first();
    }

    let mut point = rand::thread_rng().gen_range(0.0..total);
    for instance in instances {
        let weight = instance.weight.max(0.0);
        if point < weight {
            return Some(instance);
        }
        point -= weight;
    }
    instances.last()
}

// 本服务的自注册信息
pub fn self_registration(registry: &RegistryConfig, rpc: &RpcConfig) -> InstanceRegistration {
    InstanceRegistration {
        ip: rpc.ip.clone(),
        port: rpc.port,
        service_name: rpc.service_name.clone(),
        weight: rpc.weight,
        enabled: true,
        healthy: true,
        ephemeral: true,
        metadata: HashMap::from([("type".to_string(), "grpc".to_string())]),
        cluster_name: registry.cluster_name.clone(),
        group_name: registry.group_name.clone(),
    }
}
