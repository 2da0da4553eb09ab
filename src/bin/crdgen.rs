use kube::CustomResourceExt;

fn main() {
    let resources = [vault_initializer::resources::VaultMap::crd()];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource).unwrap());
    }
}
